use crate::registry::{FileRecord, FileState};
use crate::runner::DocMeta;
use crate::{AppState, VoiceHostError};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::info;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
	#[serde(default)]
	pub download: u8,
}

/// Stream the stored audio; `?download=1` forces an attachment.
pub async fn get_audio(State(state): State<AppState>, Path(file_id): Path<String>, Query(query): Query<DownloadQuery>) -> Result<Response, VoiceHostError> {
	let record = state.registry.get(&file_id).map_err(|_| VoiceHostError::NotFound)?;
	if !record.stored_path.exists() {
		return Err(VoiceHostError::validation("音频文件不存在"));
	}

	if query.download == 1 {
		stream_file(&record.stored_path, "application/octet-stream", Some(&record.original_name)).await
	} else {
		stream_file(&record.stored_path, "audio/mpeg", None).await
	}
}

/// Stream the transcript document, rendering it on demand when the
/// completed record has segments but the file went missing.
pub async fn download_transcript(State(state): State<AppState>, Path(file_id): Path<String>) -> Result<Response, VoiceHostError> {
	let record = state.registry.get(&file_id).map_err(|_| VoiceHostError::NotFound)?;
	if record.state != FileState::Completed {
		return Err(VoiceHostError::validation("文件转写未完成"));
	}

	if let Some(doc) = record.transcript_doc.clone().filter(|p| p.exists()) {
		return stream_document(&doc).await;
	}

	let segments = record.segments.clone().filter(|s| !s.is_empty()).ok_or_else(|| VoiceHostError::validation("没有转写结果"))?;
	let meta = doc_meta(&record, segments.last().map(|s| s.end_time));
	let renderer = Arc::clone(&state.renderer);
	let path = tokio::task::spawn_blocking(move || renderer.render_transcript(&segments, &meta))
		.await
		.map_err(|e| VoiceHostError::Anyhow(anyhow::anyhow!(e)))??;

	state.registry.update(&file_id, |r| r.transcript_doc = Some(path.clone()))?;
	info!("transcript document regenerated for {file_id}");
	stream_document(&path).await
}

/// Stream the summary document; requires a generated summary.
pub async fn download_summary(State(state): State<AppState>, Path(file_id): Path<String>) -> Result<Response, VoiceHostError> {
	let record = state.registry.get(&file_id).map_err(|_| VoiceHostError::NotFound)?;
	if record.state != FileState::Completed {
		return Err(VoiceHostError::validation("文件转写未完成"));
	}
	let summary = record.summary.clone().ok_or_else(|| VoiceHostError::validation("请先生成会议纪要"))?;

	if let Some(doc) = record.summary_doc.clone().filter(|p| p.exists()) {
		return stream_document(&doc).await;
	}

	let segments = record.segments.clone().unwrap_or_default();
	let meta = doc_meta(&record, segments.last().map(|s| s.end_time));
	let renderer = Arc::clone(&state.renderer);
	let path = tokio::task::spawn_blocking(move || renderer.render_summary(&segments, &summary, &meta))
		.await
		.map_err(|e| VoiceHostError::Anyhow(anyhow::anyhow!(e)))??;

	state.registry.update(&file_id, |r| r.summary_doc = Some(path.clone()))?;
	info!("summary document regenerated for {file_id}");
	stream_document(&path).await
}

fn doc_meta(record: &FileRecord, audio_duration: Option<f64>) -> DocMeta {
	DocMeta {
		file_id: record.id.clone(),
		short_id: record.short_id(),
		original_name: record.original_name.clone(),
		language: record.language,
		audio_duration,
	}
}

async fn stream_document(path: &FsPath) -> Result<Response, VoiceHostError> {
	let name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
	stream_file(path, DOCX_MIME, name.as_deref()).await
}

async fn stream_file(path: &FsPath, content_type: &str, attachment_name: Option<&str>) -> Result<Response, VoiceHostError> {
	let file = tokio::fs::File::open(path).await.map_err(|_| VoiceHostError::NotFound)?;
	let stream = ReaderStream::new(file);

	let mut builder = Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, content_type)
		.header(header::ACCEPT_RANGES, "bytes");

	if let Some(name) = attachment_name {
		builder = builder.header(header::CONTENT_DISPOSITION, format!("attachment; filename*=UTF-8''{}", percent_encode(name)));
	}

	builder
		.body(Body::from_stream(stream))
		.map_err(|e| VoiceHostError::Anyhow(anyhow::anyhow!(e)))
}

/// RFC 5987 value encoding for non-ASCII attachment names.
fn percent_encode(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for byte in raw.as_bytes() {
		match byte {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(*byte as char),
			_ => out.push_str(&format!("%{byte:02X}")),
		}
	}
	out
}
