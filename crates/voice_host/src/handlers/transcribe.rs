use crate::registry::Language;
use crate::scheduler::{SubmitOutcome, SubmitRequest};
use crate::util::parse_file_ids;
use crate::{AppState, VoiceHostError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Enqueue one or many transcription jobs, optionally blocking until every
/// job is terminal or the deadline passes.
pub async fn transcribe(State(state): State<AppState>, Json(body): Json<Value>) -> Result<Response, VoiceHostError> {
	let mut file_ids = parse_file_ids(body.get("file_ids").unwrap_or(&Value::Null));
	if file_ids.is_empty() {
		if let Some(single) = body.get("file_id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
			file_ids = vec![single.to_string()];
		}
	}

	let language = match body.get("language").and_then(Value::as_str) {
		Some(raw) => raw.parse::<Language>().map_err(VoiceHostError::Validation)?,
		None => Language::Zh,
	};
	let hotword = body
		.get("hotword")
		.and_then(Value::as_str)
		.map(str::to_string)
		.unwrap_or_else(|| state.config.hotword.clone());
	let wait = body.get("wait").and_then(Value::as_bool).unwrap_or(true);
	let timeout = body
		.get("timeout")
		.and_then(Value::as_u64)
		.unwrap_or(state.config.task_timeout);

	info!("transcribe request for {} file(s), wait={wait}", file_ids.len());

	let outcome = state
		.scheduler
		.submit(SubmitRequest {
			file_ids,
			language,
			hotword,
			wait,
			timeout: Duration::from_secs(timeout),
		})
		.await?;

	Ok(render_outcome(&state, outcome))
}

fn render_outcome(state: &AppState, outcome: SubmitOutcome) -> Response {
	match outcome {
		SubmitOutcome::Started { file_ids } => {
			let count = file_ids.len();
			let single = (count == 1).then(|| file_ids[0].clone());
			let mut response = json!({
				"success": true,
				"status": "processing",
				"message": format!("已开始转写 {count} 个文件"),
				"file_ids": file_ids,
				"count": count,
				"progress": 0,
			});
			if let Some(file_id) = single {
				if let Ok(record) = state.registry.get(&file_id) {
					response["filename"] = json!(record.original_name);
				}
				response["file_id"] = json!(file_id);
			}
			(StatusCode::OK, Json(response)).into_response()
		}
		SubmitOutcome::Finished { mut completed, failed, results } => {
			completed.sort();
			let mut response = json!({
				"success": failed.is_empty(),
				"status": "completed",
				"message": format!("转写完成 {} 个文件", completed.len()),
				"file_ids": completed,
				"results": results,
			});
			flatten_single(&mut response);
			(StatusCode::OK, Json(response)).into_response()
		}
		SubmitOutcome::TimedOut {
			mut completed,
			mut failed,
			mut pending,
			results,
		} => {
			completed.sort();
			failed.sort();
			pending.sort();
			let mut response = json!({
				"success": false,
				"status": "timeout",
				"message": "部分任务未在超时时间内完成",
				"completed_file_ids": completed,
				"failed_file_ids": failed,
				"pending_file_ids": pending,
				"results": results,
			});
			flatten_single(&mut response);
			(StatusCode::ACCEPTED, Json(response)).into_response()
		}
	}
}

/// Single-file submissions additionally expose the result at the top level
/// for older callers.
fn flatten_single(response: &mut Value) {
	let Some(results) = response.get("results").and_then(Value::as_array) else {
		return;
	};
	if results.len() != 1 {
		return;
	}
	let only = results[0].clone();

	for key in ["file_id", "filename", "status", "progress", "transcript", "error_message"] {
		if let Some(value) = only.get(key) {
			response[key] = value.clone();
		}
	}
	if only.get("error_message").is_some() {
		response["success"] = json!(false);
	}
}

/// Legacy stop endpoint. Mirrors the historic contract: HTTP 200 with a
/// success flag rather than an error status.
pub async fn stop_transcription(State(state): State<AppState>, Path(file_id): Path<String>) -> Json<Value> {
	match state.scheduler.stop(&file_id) {
		Ok(()) => Json(json!({ "success": true, "message": "已停止转写" })),
		Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
	}
}
