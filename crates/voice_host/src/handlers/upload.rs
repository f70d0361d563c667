use crate::registry::{short_id, FileRecord};
use crate::util::{allowed_extension, artifact_timestamp, stored_file_name};
use crate::{AppState, VoiceHostError};
use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

/// Accept one or more `audio_file` form parts. All filenames are validated
/// before anything is written so a bad extension rejects the whole batch.
pub async fn upload_audio(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<Value>, VoiceHostError> {
	let mut incoming: Vec<(String, bytes::Bytes)> = Vec::new();
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| VoiceHostError::validation(format!("上传表单解析失败: {e}")))?
	{
		if field.name() != Some("audio_file") {
			continue;
		}
		let Some(filename) = field.file_name().map(str::to_string) else {
			return Ok(Json(json!({ "success": false, "message": "存在空文件名的文件" })));
		};
		let data = field.bytes().await.map_err(|e| VoiceHostError::validation(format!("读取上传内容失败: {e}")))?;
		incoming.push((filename, data));
	}

	if incoming.is_empty() {
		return Ok(Json(json!({ "success": false, "message": "没有选择文件" })));
	}

	for (filename, _) in &incoming {
		if !allowed_extension(filename) {
			return Ok(Json(json!({
				"success": false,
				"message": format!("文件 {filename} 格式不支持，支持的格式：mp3, wav, m4a, flac, aac, ogg, wma"),
			})));
		}
	}

	let mut uploaded = Vec::new();
	let mut failed = Vec::new();

	for (filename, data) in incoming {
		let id = Uuid::new_v4().to_string();
		let stored_name = stored_file_name(&filename, &artifact_timestamp(), &short_id(&id));
		let stored_path = state.config.upload_dir.join(&stored_name);
		let size = data.len() as u64;

		match tokio::fs::write(&stored_path, &data).await {
			Ok(()) => {
				let record = FileRecord::new(id.clone(), filename.clone(), stored_name, stored_path, size);
				match state.registry.add(record.clone()) {
					Ok(_) => {
						info!("file uploaded: {filename}, id: {id}");
						uploaded.push(record);
					}
					Err(e) => {
						error!("failed to register upload {filename}: {e}");
						failed.push(json!({ "filename": filename, "error": e.to_string() }));
					}
				}
			}
			Err(e) => {
				error!("failed to store upload {filename}: {e}");
				failed.push(json!({ "filename": filename, "error": e.to_string() }));
			}
		}
	}

	if uploaded.is_empty() {
		return Ok(Json(json!({
			"success": false,
			"message": "所有文件上传失败",
			"failed_files": failed,
		})));
	}

	let files: Vec<Value> = uploaded.iter().map(upload_view).collect();
	let file_ids: Vec<&str> = uploaded.iter().map(|r| r.id.as_str()).collect();
	let mut response = json!({
		"success": true,
		"message": if uploaded.len() > 1 { format!("成功上传 {} 个文件", uploaded.len()) } else { "文件上传成功".to_string() },
		"files": files,
		"file_ids": file_ids,
	});

	if uploaded.len() == 1 {
		response["file"] = upload_view(&uploaded[0]);
		response["file_id"] = json!(uploaded[0].id);
	}
	if !failed.is_empty() {
		response["failed_files"] = json!(failed);
	}

	Ok(Json(response))
}

fn upload_view(record: &FileRecord) -> Value {
	json!({
		"id": record.id,
		"filename": record.stored_name,
		"original_name": record.original_name,
		"size": record.size_bytes,
		"upload_time": record.upload_time,
		"status": record.state,
		"progress": record.progress,
		"error_message": record.error_message,
	})
}
