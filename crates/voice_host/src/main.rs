use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, util::SubscriberInitExt, Layer};
use voice_host::handlers::files::merge_startup_history;
use voice_host::routes::{health::health_routes, voice::voice_routes};
use voice_host::runner::{HttpTranscriber, NoopNormalizer, OpenAiChatModel, PlainDocRenderer};
use voice_host::{AppState, BroadcastHub, Config, FileRegistry, HistoryStore, SummaryOrchestrator, TranscriptionScheduler};

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	let config = Config::parse();
	let _ = init_tracing(&config);

	// Missing storage directories are the one fatal startup condition.
	for dir in [&config.upload_dir, &config.output_dir, &config.summary_dir] {
		std::fs::create_dir_all(dir).with_context(|| format!("failed to create directory {}", dir.display()))?;
	}

	let config = Arc::new(config);
	let registry = Arc::new(FileRegistry::new());
	let history = Arc::new(HistoryStore::new(&config.output_dir));
	merge_startup_history(&registry, &history);

	let hub = BroadcastHub::new();
	let publisher = hub.start();

	let transcriber = Arc::new(HttpTranscriber::new(config.runner_url.clone()));
	let renderer = Arc::new(PlainDocRenderer::new(config.output_dir.clone(), config.summary_dir.clone()));
	let chat = Arc::new(OpenAiChatModel::new());

	let scheduler = Arc::new(TranscriptionScheduler::new(
		Arc::clone(&registry),
		Arc::clone(&history),
		publisher.clone(),
		transcriber,
		Arc::new(NoopNormalizer),
		renderer.clone(),
		config.transcription_workers,
	));
	let summarizer = Arc::new(SummaryOrchestrator::new(
		Arc::clone(&config),
		Arc::clone(&registry),
		Arc::clone(&history),
		chat,
		renderer.clone(),
	));

	let state = AppState {
		config: Arc::clone(&config),
		registry,
		history,
		hub,
		publisher,
		scheduler,
		summarizer,
		renderer,
	};

	let app = axum::Router::new()
		.merge(voice_routes(state))
		.merge(health_routes())
		.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

	let addr = format!("{}:{}", config.host, config.port);
	let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
	tracing::info!("listening on {}", listener.local_addr()?);

	let server = axum::serve(listener, app);
	tokio::select! {
		result = server => {
			if let Err(e) = result {
				tracing::error!("Server error: {}", e);
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("Received shutdown signal");
		}
	}

	tracing::info!("Shutting down...");
	Ok(())
}

#[must_use]
pub fn init_tracing(config: &Config) -> Option<()> {
	use std::str::FromStr;
	use tracing_subscriber::layer::SubscriberExt;

	let filter = EnvFilter::from_str(config.rust_log.as_deref().unwrap_or("info")).ok()?;

	tracing_subscriber::registry()
		.with(if config.log_json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.fmt_fields(JsonFields::default())
					.event_format(tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false))
					.with_filter(filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(
				tracing_subscriber::fmt::layer()
					.event_format(tracing_subscriber::fmt::format().pretty())
					.with_filter(filter),
			)
		})
		.init();
	None
}
