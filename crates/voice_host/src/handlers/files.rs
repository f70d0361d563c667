use crate::registry::{FileRecord, FileState, Language};
use crate::websocket::{EventStatus, FileStatusEvent};
use crate::{AppState, VoiceHostError};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
	pub status: Option<String>,
	pub limit: Option<usize>,
	#[serde(default)]
	pub offset: usize,
	#[serde(default)]
	pub include_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
	#[serde(default)]
	pub include_transcript: bool,
	#[serde(default)]
	pub include_summary: bool,
}

/// List files with filtering, pagination, unfiltered statistics and
/// download URLs. Raw server paths never leave this process.
pub async fn list_files(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Value>, VoiceHostError> {
	if query.include_history {
		merge_history(&state).await;
	}

	let filter = match &query.status {
		Some(status) => Some(parse_state(status)?),
		None => None,
	};
	let (records, counts, total) = state.registry.list(filter, query.limit, query.offset);

	let files: Vec<Value> = records.iter().map(list_view).collect();
	Ok(Json(json!({
		"success": true,
		"files": files,
		"pagination": {
			"total": total,
			"limit": query.limit,
			"offset": query.offset,
			"returned": files.len(),
		},
		"statistics": counts,
	})))
}

pub async fn file_detail(State(state): State<AppState>, Path(file_id): Path<String>, Query(query): Query<DetailQuery>) -> Result<Json<Value>, VoiceHostError> {
	let record = state.registry.get(&file_id).map_err(|_| VoiceHostError::NotFound)?;

	let mut file = json!({
		"id": record.id,
		"filename": record.original_name,
		"size": record.size_bytes,
		"status": record.state,
		"progress": record.progress,
		"language": record.language,
		"upload_time": record.upload_time,
		"complete_time": record.complete_time,
		"error_message": record.error_message,
		"download_urls": download_urls(&record),
	});

	let mut response = json!({ "success": true });
	if query.include_transcript && record.state == FileState::Completed {
		if let Some(segments) = &record.segments {
			let speakers: Vec<&str> = {
				let mut seen = Vec::new();
				for segment in segments {
					if !segment.speaker.is_empty() && !seen.contains(&segment.speaker.as_str()) {
						seen.push(segment.speaker.as_str());
					}
				}
				seen
			};
			response["transcript"] = json!(segments);
			response["statistics"] = json!({
				"speakers_count": speakers.len(),
				"segments_count": segments.len(),
				"total_characters": segments.iter().map(|s| s.text.chars().count()).sum::<usize>(),
				"speakers": speakers,
			});
		}
	}
	if query.include_summary {
		if let Some(summary) = &record.summary {
			response["summary"] = json!(summary);
		}
	}

	response["file"] = file.take();
	Ok(Json(response))
}

/// PATCH actions: `retranscribe` and `generate_summary`.
pub async fn update_file(State(state): State<AppState>, Path(file_id): Path<String>, Json(body): Json<Value>) -> Result<Json<Value>, VoiceHostError> {
	let action = body.get("action").and_then(Value::as_str).unwrap_or_default();

	match action {
		"retranscribe" => {
			let record = state.registry.get(&file_id).map_err(|_| VoiceHostError::NotFound)?;
			let language = match body.get("language").and_then(Value::as_str) {
				Some(raw) => raw.parse::<Language>().map_err(VoiceHostError::Validation)?,
				None => record.language,
			};
			let hotword = body
				.get("hotword")
				.and_then(Value::as_str)
				.map(str::to_string)
				.unwrap_or_else(|| state.config.hotword.clone());

			state.scheduler.retranscribe(&file_id, language, hotword)?;
			Ok(Json(json!({
				"success": true,
				"message": "已开始重新转写",
				"file_id": file_id,
				"status": "processing",
			})))
		}
		"generate_summary" => {
			let prompt = body.get("prompt").and_then(Value::as_str).map(str::to_string);
			let model = body.get("model").and_then(Value::as_str).map(str::to_string);
			let summary = state.summarizer.generate(&file_id, prompt, model).await?;
			Ok(Json(json!({
				"success": true,
				"message": "会议纪要生成成功",
				"summary": summary,
			})))
		}
		other => Err(VoiceHostError::validation(format!("不支持的操作: {other}"))),
	}
}

/// Delete one record and its artifacts, or everything via `_clear_all`.
pub async fn delete_file(State(state): State<AppState>, Path(file_id): Path<String>) -> Result<Json<Value>, VoiceHostError> {
	if file_id == "_clear_all" {
		return clear_all(&state).await;
	}

	let record = match state.registry.remove(&file_id) {
		Ok(record) => record,
		Err(crate::registry::RegistryError::NotFound(_)) => return Err(VoiceHostError::NotFound),
		Err(crate::registry::RegistryError::Busy(_)) => return Err(VoiceHostError::conflict("文件正在处理中，无法删除")),
		Err(e) => return Err(e.into()),
	};

	remove_artifacts(&record).await;
	save_history(&state).await;

	state
		.publisher
		.publish(FileStatusEvent::new(&file_id, EventStatus::Deleted, 0, format!("文件已删除: {}", record.original_name)));
	info!("file deleted: {}, id: {file_id}", record.original_name);

	Ok(Json(json!({ "success": true, "message": "文件删除成功" })))
}

async fn clear_all(state: &AppState) -> Result<Json<Value>, VoiceHostError> {
	let removed = state.registry.drain_non_processing();

	let mut audio_count = 0usize;
	let mut transcript_count = 0usize;
	let mut summary_count = 0usize;

	for record in &removed {
		if tokio::fs::remove_file(&record.stored_path).await.is_ok() {
			audio_count += 1;
		}
		if let Some(doc) = &record.transcript_doc {
			if tokio::fs::remove_file(doc).await.is_ok() {
				transcript_count += 1;
			}
		}
		if let Some(doc) = &record.summary_doc {
			if tokio::fs::remove_file(doc).await.is_ok() {
				summary_count += 1;
			}
		}
	}

	let history = Arc::clone(&state.history);
	if let Err(e) = tokio::task::spawn_blocking(move || history.clear())
		.await
		.unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
	{
		warn!("failed to reset history file: {e}");
	}

	info!(
		"cleared history: {audio_count} audio files, {transcript_count} transcripts, {summary_count} summaries, {} records",
		removed.len()
	);

	Ok(Json(json!({
		"success": true,
		"message": "清空所有历史记录成功",
		"deleted": {
			"audio_files": audio_count,
			"transcript_files": transcript_count,
			"summary_files": summary_count,
			"records": removed.len(),
		},
	})))
}

/// Legacy status endpoint; answers 200 with a success flag either way.
pub async fn get_status(State(state): State<AppState>, Path(file_id): Path<String>) -> Json<Value> {
	match state.registry.get(&file_id) {
		Ok(record) => Json(json!({
			"success": true,
			"status": record.state,
			"progress": record.progress,
			"error_message": record.error_message,
		})),
		Err(_) => Json(json!({ "success": false, "message": "文件不存在" })),
	}
}

/// Legacy result endpoint: the full transcript including word timings.
pub async fn get_result(State(state): State<AppState>, Path(file_id): Path<String>) -> Json<Value> {
	match state.registry.get(&file_id) {
		Ok(record) if record.state == FileState::Completed => Json(json!({
			"success": true,
			"file_info": {
				"id": record.id,
				"original_name": record.original_name,
				"upload_time": record.upload_time,
			},
			"transcript": record.segments.unwrap_or_default(),
			"summary": record.summary,
		})),
		Ok(_) => Json(json!({ "success": false, "message": "文件转写未完成" })),
		Err(_) => Json(json!({ "success": false, "message": "文件不存在" })),
	}
}

/// Legacy history digest.
pub async fn list_history(State(state): State<AppState>) -> Json<Value> {
	merge_history(&state).await;

	let mut records: Vec<Value> = state
		.registry
		.all()
		.into_iter()
		.filter(|record| record.state == FileState::Completed)
		.map(|record| {
			let segments = record.segments.as_deref().unwrap_or_default();
			let speakers: std::collections::HashSet<&str> = segments.iter().map(|s| s.speaker.as_str()).filter(|s| !s.is_empty()).collect();
			json!({
				"file_id": record.id,
				"filename": record.original_name,
				"transcribe_time": record.complete_time.clone().unwrap_or_else(|| record.upload_time.clone()),
				"status": "completed",
				"details": format!("{}位发言人, {}段对话", speakers.len(), segments.len()),
			})
		})
		.collect();
	records.sort_by(|a, b| b["transcribe_time"].as_str().cmp(&a["transcribe_time"].as_str()));

	info!("returning {} history records", records.len());
	Json(json!({ "success": true, "records": records, "total": records.len() }))
}

pub async fn get_languages() -> Json<Value> {
	let languages: Vec<Value> = Language::all()
		.into_iter()
		.map(|language| {
			json!({
				"value": language.as_str(),
				"name": language.name(),
				"description": language.description(),
			})
		})
		.collect();
	Json(json!({ "success": true, "languages": languages }))
}

/// Startup variant: fold the persisted history into a fresh registry.
pub fn merge_startup_history(registry: &crate::registry::FileRegistry, history: &crate::history::HistoryStore) {
	registry.merge_history(history.load());
}

pub(crate) async fn merge_history(state: &AppState) {
	let history = Arc::clone(&state.history);
	match tokio::task::spawn_blocking(move || history.load()).await {
		Ok(records) => state.registry.merge_history(records),
		Err(e) => warn!("history load task failed: {e}"),
	}
}

pub(crate) async fn save_history(state: &AppState) {
	let history = Arc::clone(&state.history);
	let completed = state.registry.completed_records();
	let saved = tokio::task::spawn_blocking(move || history.save(&completed))
		.await
		.unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
	if let Err(e) = saved {
		warn!("history save failed: {e}");
	}
}

async fn remove_artifacts(record: &FileRecord) {
	if let Err(e) = tokio::fs::remove_file(&record.stored_path).await {
		warn!("failed to remove audio {}: {e}", record.stored_path.display());
	}
	if let Some(doc) = &record.transcript_doc {
		if let Err(e) = tokio::fs::remove_file(doc).await {
			warn!("failed to remove transcript document {}: {e}", doc.display());
		}
	}
	if let Some(doc) = &record.summary_doc {
		if let Err(e) = tokio::fs::remove_file(doc).await {
			warn!("failed to remove summary document {}: {e}", doc.display());
		}
	}
}

fn parse_state(raw: &str) -> Result<FileState, VoiceHostError> {
	match raw {
		"uploaded" => Ok(FileState::Uploaded),
		"processing" => Ok(FileState::Processing),
		"completed" => Ok(FileState::Completed),
		"error" => Ok(FileState::Error),
		other => Err(VoiceHostError::validation(format!("无效的状态过滤: {other}"))),
	}
}

fn download_urls(record: &FileRecord) -> Value {
	let mut urls = json!({
		"audio": format!("/api/voice/audio/{}?download=1", record.id),
	});
	if record.transcript_doc.is_some() {
		urls["transcript"] = json!(format!("/api/voice/download_transcript/{}", record.id));
	}
	if record.summary_doc.is_some() {
		urls["summary"] = json!(format!("/api/voice/download_summary/{}", record.id));
	}
	urls
}

fn list_view(record: &FileRecord) -> Value {
	json!({
		"id": record.id,
		"filename": record.original_name,
		"original_name": record.original_name,
		"size": record.size_bytes,
		"status": record.state,
		"progress": record.progress,
		"language": record.language,
		"upload_time": record.upload_time,
		"complete_time": record.complete_time,
		"error_message": record.error_message,
		"has_transcript": record.segments.is_some(),
		"has_summary": record.summary.is_some(),
		"download_urls": download_urls(record),
	})
}
