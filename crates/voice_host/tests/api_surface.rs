use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use clap::Parser;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use voice_host::config::ModelEndpoint;
use voice_host::handlers::files::merge_startup_history;
use voice_host::routes::{health::health_routes, voice::voice_routes};
use voice_host::runner::{CancelCheck, ChatModel, DocRenderer, PlainDocRenderer, ProgressFn, ProgressUpdate, RunnerError, TranscribeJob, Transcriber};
use voice_host::{AppState, BroadcastHub, Config, FileRegistry, HistoryStore, Segment, SummaryOrchestrator, TranscriptionScheduler};

/// Deterministic runner: reports a couple of stages, honours cancellation,
/// then returns two segments with word timings.
struct ScriptedRunner {
	step_delay: Duration,
}

impl Transcriber for ScriptedRunner {
	fn transcribe(&self, _job: &TranscribeJob, cancel: CancelCheck<'_>, progress: ProgressFn<'_>) -> Result<Vec<Segment>, RunnerError> {
		for step in [10u8, 60, 95] {
			if cancel() {
				return Err(RunnerError::Cancelled);
			}
			progress(ProgressUpdate {
				stage: "asr".to_string(),
				progress: step,
				message: String::new(),
				eta_millis: Some(20),
			});
			std::thread::sleep(self.step_delay);
		}
		if cancel() {
			return Err(RunnerError::Cancelled);
		}
		Ok(vec![
			Segment {
				speaker: "发言人1".to_string(),
				text: "第一段".to_string(),
				start_time: 0.0,
				end_time: 3.0,
				words: Some(vec![voice_host::registry::Word {
					text: "第一段".to_string(),
					start: 0.0,
					end: 3.0,
				}]),
			},
			Segment {
				speaker: "发言人2".to_string(),
				text: "第二段".to_string(),
				start_time: 3.0,
				end_time: 6.0,
				words: None,
			},
		])
	}
}

struct NoChat;

#[async_trait::async_trait]
impl ChatModel for NoChat {
	async fn chat(&self, _system: &str, _user: &str, _endpoint: &ModelEndpoint) -> Result<String, RunnerError> {
		Err(RunnerError::Transport("not configured".to_string()))
	}
}

fn build_app(dir: &std::path::Path, step_delay: Duration) -> (Router, AppState) {
	let mut config = Config::parse_from([
		"voice_host",
		"--upload-dir",
		dir.join("uploads").to_str().unwrap(),
		"--output-dir",
		dir.join("transcripts").to_str().unwrap(),
		"--summary-dir",
		dir.join("meeting_summaries").to_str().unwrap(),
	]);
	// Force the template fallback regardless of ambient environment keys.
	config.deepseek_api_key = None;
	config.qwen_api_key = None;
	config.glm_api_key = None;
	for sub in [&config.upload_dir, &config.output_dir, &config.summary_dir] {
		std::fs::create_dir_all(sub).unwrap();
	}
	let config = Arc::new(config);

	let registry = Arc::new(FileRegistry::new());
	let history = Arc::new(HistoryStore::new(&config.output_dir));
	merge_startup_history(&registry, &history);

	let hub = BroadcastHub::new();
	let publisher = hub.start();
	let transcriber = Arc::new(ScriptedRunner { step_delay });
	let renderer: Arc<dyn DocRenderer> = Arc::new(PlainDocRenderer::new(config.output_dir.clone(), config.summary_dir.clone()));

	let scheduler = Arc::new(TranscriptionScheduler::new(
		Arc::clone(&registry),
		Arc::clone(&history),
		publisher.clone(),
		transcriber,
		Arc::new(voice_host::runner::NoopNormalizer),
		Arc::clone(&renderer),
		4,
	));
	let summarizer = Arc::new(SummaryOrchestrator::new(
		Arc::clone(&config),
		Arc::clone(&registry),
		Arc::clone(&history),
		Arc::new(NoChat),
		Arc::clone(&renderer),
	));

	let state = AppState {
		config,
		registry,
		history,
		hub,
		publisher,
		scheduler,
		summarizer,
		renderer,
	};
	let app = Router::new().merge(voice_routes(state.clone())).merge(health_routes());
	(app, state)
}

fn multipart_upload(filename: &str, payload: &[u8]) -> Request<Body> {
	let boundary = "voicehosttestboundary";
	let mut body = Vec::new();
	body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
	body.extend_from_slice(format!("Content-Disposition: form-data; name=\"audio_file\"; filename=\"{filename}\"\r\n").as_bytes());
	body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
	body.extend_from_slice(payload);
	body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

	Request::builder()
		.method("POST")
		.uri("/api/voice/upload")
		.header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
		.body(Body::from(body))
		.unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
	Request::builder()
		.method(method)
		.uri(uri)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.unwrap()
}

async fn response_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
	let response = app.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let bytes = response.into_body().collect().await.unwrap().to_bytes();
	let value = if bytes.is_empty() {
		Value::Null
	} else {
		serde_json::from_slice(&bytes).unwrap_or(Value::Null)
	};
	(status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
	response_json(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_is_always_healthy() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (status, body) = get(&app, "/healthz").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["status"], "healthy");
}

#[tokio::test(flavor = "multi_thread")]
async fn languages_is_the_closed_set() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (status, body) = get(&app, "/api/voice/languages").await;
	assert_eq!(status, StatusCode::OK);
	let values: Vec<&str> = body["languages"].as_array().unwrap().iter().map(|l| l["value"].as_str().unwrap()).collect();
	assert_eq!(values, ["zh", "zh-dialect", "zh-en", "en"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_rejects_unsupported_extensions() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (status, body) = response_json(&app, multipart_upload("notes.txt", b"not audio")).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], false);
	assert!(body["message"].as_str().unwrap().contains("格式不支持"));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_upload_and_blocking_transcribe() {
	let dir = tempfile::tempdir().unwrap();
	let (app, state) = build_app(dir.path(), Duration::from_millis(1));

	let (status, body) = response_json(&app, multipart_upload("meeting.mp3", &[0u8; 4096])).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], true);
	assert_eq!(body["files"][0]["status"], "uploaded");
	let file_id = body["file_id"].as_str().unwrap().to_string();
	assert_eq!(body["file_ids"][0], json!(file_id));

	let (status, body) = response_json(
		&app,
		json_request(
			"POST",
			"/api/voice/transcribe",
			json!({ "file_ids": [file_id], "language": "zh", "wait": true, "timeout": 60 }),
		),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], true);
	assert_eq!(body["status"], "completed");
	let transcript = body["transcript"].as_array().unwrap();
	assert!(!transcript.is_empty());
	for entry in transcript {
		assert!(entry.get("speaker").is_some());
		assert!(entry.get("text").is_some());
		assert!(entry.get("start_time").is_some());
		assert!(entry.get("end_time").is_some());
		assert!(entry.get("words").is_none());
	}

	// Legacy status and result endpoints agree; the result keeps words.
	let (_, status_body) = get(&app, &format!("/api/voice/status/{file_id}")).await;
	assert_eq!(status_body["status"], "completed");
	assert_eq!(status_body["progress"], 100);

	let (_, result_body) = get(&app, &format!("/api/voice/result/{file_id}")).await;
	assert_eq!(result_body["success"], true);
	assert!(result_body["transcript"][0]["words"].is_array());

	// The listing carries download URLs, never raw paths.
	let (_, list_body) = get(&app, "/api/voice/files").await;
	let entry = &list_body["files"][0];
	assert_eq!(entry["status"], "completed");
	assert!(entry["download_urls"]["audio"].as_str().unwrap().starts_with("/api/voice/audio/"));
	assert!(entry["download_urls"]["transcript"].as_str().is_some());
	assert!(entry.get("filepath").is_none());
	assert_eq!(list_body["statistics"]["completed"], 1);

	// The transcript document is downloadable.
	let response = app
		.clone()
		.oneshot(Request::builder().uri(format!("/api/voice/download_transcript/{file_id}")).body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	// And the record survives in the history store.
	tokio::time::sleep(Duration::from_millis(200)).await;
	let history = state.history.load();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].id, file_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_guard_requires_stop_first() {
	let dir = tempfile::tempdir().unwrap();
	let (app, state) = build_app(dir.path(), Duration::from_millis(300));

	let (_, body) = response_json(&app, multipart_upload("long.mp3", &[0u8; 1024])).await;
	let file_id = body["file_id"].as_str().unwrap().to_string();

	let (status, _) = response_json(
		&app,
		json_request("POST", "/api/voice/transcribe", json!({ "file_id": file_id, "wait": false })),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	tokio::time::sleep(Duration::from_millis(100)).await;

	// Deleting a live processing record is refused.
	let (status, body) = response_json(
		&app,
		Request::builder()
			.method("DELETE")
			.uri(format!("/api/voice/files/{file_id}"))
			.body(Body::empty())
			.unwrap(),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["success"], false);

	// After a stop the same delete goes through.
	let (_, body) = response_json(
		&app,
		Request::builder()
			.method("POST")
			.uri(format!("/api/voice/stop/{file_id}"))
			.body(Body::empty())
			.unwrap(),
	)
	.await;
	assert_eq!(body["success"], true);

	let (status, body) = response_json(
		&app,
		Request::builder()
			.method("DELETE")
			.uri(format!("/api/voice/files/{file_id}"))
			.body(Body::empty())
			.unwrap(),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], true);
	assert!(state.registry.get(&file_id).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn history_survives_a_restart() {
	let dir = tempfile::tempdir().unwrap();

	let file_id = {
		let (app, _) = build_app(dir.path(), Duration::from_millis(1));
		let (_, body) = response_json(&app, multipart_upload("first.mp3", &[0u8; 512])).await;
		let file_id = body["file_id"].as_str().unwrap().to_string();
		let (status, _) = response_json(
			&app,
			json_request("POST", "/api/voice/transcribe", json!({ "file_id": file_id, "wait": true, "timeout": 30 })),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		// The history write happens just after the record turns completed;
		// give it a moment before simulating the restart.
		tokio::time::sleep(Duration::from_millis(200)).await;
		file_id
	};

	// A fresh process sees the completed record through the history file.
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));
	let (_, body) = get(&app, "/api/voice/files?include_history=true").await;
	let files = body["files"].as_array().unwrap();
	assert_eq!(files.len(), 1);
	assert_eq!(files[0]["id"], json!(file_id));
	assert_eq!(files[0]["status"], "completed");

	let (_, detail) = get(&app, &format!("/api/voice/files/{file_id}?include_transcript=true")).await;
	assert_eq!(detail["success"], true);
	assert!(!detail["transcript"].as_array().unwrap().is_empty());
	assert_eq!(detail["statistics"]["speakers_count"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn tolerant_file_ids_forms_are_accepted() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (_, body) = response_json(&app, multipart_upload("a.mp3", &[0u8; 128])).await;
	let file_id = body["file_id"].as_str().unwrap().to_string();

	// A Python-literal list string still enqueues the job.
	let (status, body) = response_json(
		&app,
		json_request(
			"POST",
			"/api/voice/transcribe",
			json!({ "file_ids": format!("['{file_id}']"), "wait": true, "timeout": 30 }),
		),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["status"], "completed");
}

#[tokio::test(flavor = "multi_thread")]
async fn transcribe_unknown_id_is_a_client_error() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (status, body) = response_json(
		&app,
		json_request("POST", "/api/voice/transcribe", json!({ "file_id": "does-not-exist", "wait": false })),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["success"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn generate_summary_without_chat_backend_uses_template() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(1));

	let (_, body) = response_json(&app, multipart_upload("sum.mp3", &[0u8; 128])).await;
	let file_id = body["file_id"].as_str().unwrap().to_string();
	response_json(
		&app,
		json_request("POST", "/api/voice/transcribe", json!({ "file_id": file_id, "wait": true, "timeout": 30 })),
	)
	.await;

	let (status, body) = response_json(
		&app,
		json_request("PATCH", &format!("/api/voice/files/{file_id}"), json!({ "action": "generate_summary" })),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["success"], true);
	assert_eq!(body["summary"]["model"], "default_template");

	// The summary document is now downloadable.
	let response = app
		.clone()
		.oneshot(Request::builder().uri(format!("/api/voice/download_summary/{file_id}")).body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn retranscribe_is_refused_while_processing() {
	let dir = tempfile::tempdir().unwrap();
	let (app, _) = build_app(dir.path(), Duration::from_millis(300));

	let (_, body) = response_json(&app, multipart_upload("busy.mp3", &[0u8; 128])).await;
	let file_id = body["file_id"].as_str().unwrap().to_string();
	response_json(
		&app,
		json_request("POST", "/api/voice/transcribe", json!({ "file_id": file_id, "wait": false })),
	)
	.await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let (status, _) = response_json(
		&app,
		json_request("PATCH", &format!("/api/voice/files/{file_id}"), json!({ "action": "retranscribe" })),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}
