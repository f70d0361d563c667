use crate::handlers::{downloads, files, summary, transcribe, upload};
use crate::websocket::websocket_handler;
use crate::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

/// Maximum accepted upload body. Batches of long recordings are normal.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn voice_routes(state: AppState) -> Router {
	Router::new()
		.route("/api/voice/upload", post(upload::upload_audio))
		.route("/api/voice/transcribe", post(transcribe::transcribe))
		.route("/api/voice/stop/:file_id", post(transcribe::stop_transcription))
		.route("/api/voice/status/:file_id", get(files::get_status))
		.route("/api/voice/result/:file_id", get(files::get_result))
		.route("/api/voice/files", get(files::list_files))
		.route(
			"/api/voice/files/:file_id",
			get(files::file_detail).patch(files::update_file).delete(files::delete_file),
		)
		.route("/api/voice/generate_summary/:file_id", post(summary::generate_summary_legacy))
		.route("/api/voice/audio/:file_id", get(downloads::get_audio))
		.route("/api/voice/download_transcript/:file_id", get(downloads::download_transcript))
		.route("/api/voice/download_summary/:file_id", get(downloads::download_summary))
		.route("/api/voice/history", get(files::list_history))
		.route("/api/voice/languages", get(files::get_languages))
		.route("/api/voice/ws", get(websocket_handler))
		.layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
		.with_state(state)
}
