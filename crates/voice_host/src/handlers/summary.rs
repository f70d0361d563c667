use crate::{AppState, VoiceHostError};
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

/// Legacy summary endpoint; same contract as the PATCH action.
pub async fn generate_summary_legacy(State(state): State<AppState>, Path(file_id): Path<String>, body: Option<Json<Value>>) -> Result<Json<Value>, VoiceHostError> {
	let body = body.map(|Json(value)| value).unwrap_or(Value::Null);
	let prompt = body.get("prompt").and_then(Value::as_str).map(str::to_string);
	let model = body.get("model").and_then(Value::as_str).map(str::to_string);

	let summary = state.summarizer.generate(&file_id, prompt, model).await?;
	Ok(Json(json!({
		"success": true,
		"message": "会议纪要生成成功",
		"summary": summary,
	})))
}
