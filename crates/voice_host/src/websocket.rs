use crate::registry::FileState;
use crate::AppState;
use axum::{
	extract::{
		ws::{Message, WebSocket, WebSocketUpgrade},
		State,
	},
	response::IntoResponse,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outbound queue depth per client; a slow consumer drops events rather
/// than back-pressuring publishers.
const SESSION_QUEUE_DEPTH: usize = 64;

/// Depth of the shared publish channel drained into the hub.
const PUBLISH_QUEUE_DEPTH: usize = 256;

/// Wire status of a file, as broadcast to clients. Superset of the record
/// lifecycle: deletion is announced too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
	Uploaded,
	Processing,
	Completed,
	Error,
	Deleted,
}

impl EventStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Error | Self::Deleted)
	}
}

impl From<FileState> for EventStatus {
	fn from(state: FileState) -> Self {
		match state {
			FileState::Uploaded => Self::Uploaded,
			FileState::Processing => Self::Processing,
			FileState::Completed => Self::Completed,
			FileState::Error => Self::Error,
		}
	}
}

/// A single per-file status tick, produced by trackers and workers.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStatusEvent {
	pub file_id: String,
	pub status: EventStatus,
	pub progress: u8,
	pub message: String,
}

impl FileStatusEvent {
	pub fn new(file_id: impl Into<String>, status: EventStatus, progress: u8, message: impl Into<String>) -> Self {
		Self {
			file_id: file_id.into(),
			status,
			progress,
			message: message.into(),
		}
	}
}

/// Messages sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
	Connected {
		message: String,
	},
	Subscribed {
		file_id: String,
		message: String,
	},
	FileStatus {
		file_id: String,
		status: EventStatus,
		progress: u8,
		message: String,
	},
}

impl From<FileStatusEvent> for WsEvent {
	fn from(event: FileStatusEvent) -> Self {
		WsEvent::FileStatus {
			file_id: event.file_id,
			status: event.status,
			progress: event.progress,
			message: event.message,
		}
	}
}

/// Control messages a client may send. Anything that does not parse is
/// ignored without a reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
	Subscribe { file_id: Option<String> },
	Unsubscribe { file_id: Option<String> },
}

struct Session {
	sender: mpsc::Sender<WsEvent>,
	subscriptions: HashSet<String>,
	/// Last `{progress, status}` accepted per file, for de-duplication.
	last_seen: HashMap<String, (u8, EventStatus)>,
}

/// Fan-out of file status events to connected clients.
///
/// Every attached session receives the global stream; delivery is filtered
/// per session so no client ever observes a progress regression or a
/// duplicate tick. Each session owns a bounded queue; overflow drops the
/// event for that session only, and because the de-dup memory is updated
/// only on accepted sends the next accepted event re-synchronises it.
#[derive(Clone, Default)]
pub struct BroadcastHub {
	sessions: Arc<DashMap<String, Session>>,
}

/// Cheap handle producers use to publish. Backed by a bounded channel that
/// a dedicated task drains into the hub, so publishing never blocks and is
/// safe from blocking worker threads.
#[derive(Clone)]
pub struct StatusPublisher {
	tx: mpsc::Sender<FileStatusEvent>,
}

impl StatusPublisher {
	pub fn publish(&self, event: FileStatusEvent) {
		if let Err(e) = self.tx.try_send(event) {
			warn!("status publish queue full, dropping event: {e}");
		}
	}
}

impl BroadcastHub {
	pub fn new() -> Self {
		Self::default()
	}

	/// Spawn the drain task and hand back the publisher side.
	pub fn start(&self) -> StatusPublisher {
		let (tx, mut rx) = mpsc::channel::<FileStatusEvent>(PUBLISH_QUEUE_DEPTH);
		let hub = self.clone();
		tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				hub.deliver(&event);
			}
			debug!("status publish channel closed");
		});
		StatusPublisher { tx }
	}

	pub fn attach(&self, session_id: &str) -> mpsc::Receiver<WsEvent> {
		let (sender, receiver) = mpsc::channel(SESSION_QUEUE_DEPTH);
		self.sessions.insert(
			session_id.to_string(),
			Session {
				sender,
				subscriptions: HashSet::new(),
				last_seen: HashMap::new(),
			},
		);
		info!("websocket session attached, connections: {}", self.sessions.len());
		receiver
	}

	pub fn detach(&self, session_id: &str) {
		if self.sessions.remove(session_id).is_some() {
			info!("websocket session detached, connections: {}", self.sessions.len());
		}
	}

	pub fn subscribe(&self, session_id: &str, file_id: &str) {
		if let Some(mut session) = self.sessions.get_mut(session_id) {
			session.subscriptions.insert(file_id.to_string());
		}
	}

	pub fn unsubscribe(&self, session_id: &str, file_id: &str) {
		if let Some(mut session) = self.sessions.get_mut(session_id) {
			session.subscriptions.remove(file_id);
		}
	}

	pub fn is_subscribed(&self, session_id: &str, file_id: &str) -> bool {
		self.sessions.get(session_id).map_or(false, |session| session.subscriptions.contains(file_id))
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	/// Send one event to a single session, bypassing de-duplication.
	fn send_to(&self, session_id: &str, event: WsEvent) {
		if let Some(session) = self.sessions.get(session_id) {
			if let Err(e) = session.sender.try_send(event) {
				warn!("failed to queue event for session {session_id}: {e}");
			}
		}
	}

	/// Deliver a status event to every attached session, applying the
	/// per-session monotone filter.
	pub fn deliver(&self, event: &FileStatusEvent) {
		for mut entry in self.sessions.iter_mut() {
			let session = entry.value_mut();
			let last = session.last_seen.get(&event.file_id).copied();
			let accept = match last {
				None => true,
				Some((progress, status)) => event.progress > progress || event.status != status || event.status.is_terminal(),
			};
			if !accept {
				continue;
			}

			match session.sender.try_send(WsEvent::from(event.clone())) {
				Ok(()) => {
					if event.status.is_terminal() {
						session.last_seen.remove(&event.file_id);
					} else {
						session.last_seen.insert(event.file_id.clone(), (event.progress, event.status));
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					// Slow consumer: drop for this session only. last_seen is
					// untouched so the next accepted event resynchronises.
					debug!("session queue full, dropping {} event for {}", event.progress, event.file_id);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}
	}
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

async fn handle_socket(socket: WebSocket, hub: BroadcastHub) {
	let session_id = Uuid::new_v4().to_string();
	let mut events = hub.attach(&session_id);
	let (mut sink, mut stream) = socket.split();

	let greeting = WsEvent::Connected {
		message: "WebSocket连接已建立".to_string(),
	};
	match serde_json::to_string(&greeting) {
		Ok(json) => {
			if let Err(e) = sink.send(Message::Text(json)).await {
				error!("failed to greet session {session_id}: {e}");
				hub.detach(&session_id);
				return;
			}
		}
		Err(e) => error!("failed to serialize greeting: {e}"),
	}

	let forward_task = {
		let session_id = session_id.clone();
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				let json = match serde_json::to_string(&event) {
					Ok(json) => json,
					Err(e) => {
						error!("failed to serialize event for session {session_id}: {e}");
						continue;
					}
				};
				if sink.send(Message::Text(json)).await.is_err() {
					break;
				}
			}
		})
	};

	while let Some(result) = stream.next().await {
		match result {
			Ok(Message::Text(text)) => handle_client_message(&hub, &session_id, &text),
			Ok(Message::Close(reason)) => {
				debug!("session {session_id} closed: {reason:?}");
				break;
			}
			Ok(_) => {}
			Err(e) => {
				warn!("websocket error for session {session_id}: {e}");
				break;
			}
		}
	}

	hub.detach(&session_id);
	forward_task.abort();
}

fn handle_client_message(hub: &BroadcastHub, session_id: &str, raw: &str) {
	let message = match serde_json::from_str::<ClientMessage>(raw) {
		Ok(message) => message,
		// Malformed control messages are ignored by contract.
		Err(_) => return,
	};

	match message {
		ClientMessage::Subscribe { file_id: Some(file_id) } => {
			hub.subscribe(session_id, &file_id);
			hub.send_to(
				session_id,
				WsEvent::Subscribed {
					message: format!("已订阅文件 {file_id} 的状态更新"),
					file_id,
				},
			);
		}
		ClientMessage::Unsubscribe { file_id: Some(file_id) } => {
			hub.unsubscribe(session_id, &file_id);
		}
		_ => {}
	}
}
