use axum::extract::FromRef;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod handlers;
pub mod history;
pub mod progress;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod scheduler;
pub mod summary;
pub mod util;
pub mod websocket;

pub use config::{Config, ModelEndpoint, ModelKey};
pub use error::VoiceHostError;
pub use history::HistoryStore;
pub use registry::{FileRecord, FileRegistry, FileState, Language, Segment, Summary};
pub use scheduler::TranscriptionScheduler;
pub use summary::SummaryOrchestrator;
pub use websocket::{BroadcastHub, FileStatusEvent, StatusPublisher};

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub registry: Arc<FileRegistry>,
	pub history: Arc<HistoryStore>,
	pub hub: BroadcastHub,
	pub publisher: StatusPublisher,
	pub scheduler: Arc<TranscriptionScheduler>,
	pub summarizer: Arc<SummaryOrchestrator>,
	pub renderer: Arc<dyn runner::DocRenderer>,
}

impl FromRef<AppState> for Arc<Config> {
	fn from_ref(state: &AppState) -> Self {
		state.config.clone()
	}
}

impl FromRef<AppState> for Arc<FileRegistry> {
	fn from_ref(state: &AppState) -> Self {
		state.registry.clone()
	}
}

impl FromRef<AppState> for BroadcastHub {
	fn from_ref(state: &AppState) -> Self {
		state.hub.clone()
	}
}
