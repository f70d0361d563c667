use crate::config::ModelEndpoint;
use crate::registry::{Language, Segment, Summary};
use crate::util::artifact_timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
	/// Cooperative stop observed by the runner. Not a failure.
	#[error("转写任务已被取消")]
	Cancelled,

	#[error("runner transport error: {0}")]
	Transport(String),

	#[error("转写失败: {0}")]
	Failed(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Everything the external recognition runner needs for one file.
#[derive(Debug, Clone)]
pub struct TranscribeJob {
	pub file_id: String,
	pub audio_path: PathBuf,
	pub language: Language,
	pub hotword: String,
}

/// A sparse progress report from the runner, forwarded to the tracker.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
	pub stage: String,
	pub progress: u8,
	pub message: String,
	pub eta_millis: Option<u64>,
}

pub type CancelCheck<'a> = &'a (dyn Fn() -> bool + Sync);
pub type ProgressFn<'a> = &'a (dyn Fn(ProgressUpdate) + Sync);

/// The external speech recognition subsystem. The call blocks for the whole
/// run; the scheduler drives it from a blocking task. Implementations must
/// poll `cancel` at stage boundaries and raise [`RunnerError::Cancelled`].
pub trait Transcriber: Send + Sync {
	fn transcribe(&self, job: &TranscribeJob, cancel: CancelCheck<'_>, progress: ProgressFn<'_>) -> Result<Vec<Segment>, RunnerError>;
}

/// Audio pre-processing to the runner's target format. May no-op when the
/// file already conforms.
pub trait Normalizer: Send + Sync {
	fn normalize(&self, path: &Path) -> Result<PathBuf, RunnerError>;
}

pub struct NoopNormalizer;

impl Normalizer for NoopNormalizer {
	fn normalize(&self, path: &Path) -> Result<PathBuf, RunnerError> {
		Ok(path.to_path_buf())
	}
}

/// Metadata handed to the document renderer alongside the content.
#[derive(Debug, Clone)]
pub struct DocMeta {
	pub file_id: String,
	pub short_id: String,
	pub original_name: String,
	pub language: Language,
	pub audio_duration: Option<f64>,
}

/// Renders transcript and summary documents to disk and returns the path.
pub trait DocRenderer: Send + Sync {
	fn render_transcript(&self, segments: &[Segment], meta: &DocMeta) -> Result<PathBuf, RunnerError>;
	fn render_summary(&self, segments: &[Segment], summary: &Summary, meta: &DocMeta) -> Result<PathBuf, RunnerError>;
}

/// Plain-text stand-in for the Word renderer. Produces the contractual
/// `<prefix>_<timestamp>_<id8>.docx` names; a real docx writer slots in
/// behind the same trait.
pub struct PlainDocRenderer {
	output_dir: PathBuf,
	summary_dir: PathBuf,
}

impl PlainDocRenderer {
	pub fn new(output_dir: PathBuf, summary_dir: PathBuf) -> Self {
		Self { output_dir, summary_dir }
	}

	fn write(dir: &Path, prefix: &str, short_id: &str, body: &str) -> Result<PathBuf, RunnerError> {
		let filename = format!("{prefix}_{}_{short_id}.docx", artifact_timestamp());
		let path = dir.join(filename);
		let mut file = std::fs::File::create(&path)?;
		file.write_all(body.as_bytes())?;
		Ok(path)
	}
}

impl DocRenderer for PlainDocRenderer {
	fn render_transcript(&self, segments: &[Segment], meta: &DocMeta) -> Result<PathBuf, RunnerError> {
		let mut body = format!("会议转写记录\n音频文件: {}\n语言: {}\n\n", meta.original_name, meta.language.name());
		for segment in segments {
			body.push_str(&format!(
				"[{:.2}s - {:.2}s] {}: {}\n",
				segment.start_time, segment.end_time, segment.speaker, segment.text
			));
		}
		let path = Self::write(&self.output_dir, "transcript", &meta.short_id, &body)?;
		info!("transcript document saved: {}", path.display());
		Ok(path)
	}

	fn render_summary(&self, _segments: &[Segment], summary: &Summary, meta: &DocMeta) -> Result<PathBuf, RunnerError> {
		let mut body = format!("会议纪要\n音频文件: {}\n生成时间: {}\n", meta.original_name, summary.generated_at);
		if let Some(duration) = meta.audio_duration {
			body.push_str(&format!("音频时长: {duration:.1}秒\n"));
		}
		body.push('\n');
		body.push_str(&summary.raw_text);
		let path = Self::write(&self.summary_dir, "meeting_summary", &meta.short_id, &body)?;
		info!("summary document saved: {}", path.display());
		Ok(path)
	}
}

/// An OpenAI-compatible chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
	async fn chat(&self, system: &str, user: &str, endpoint: &ModelEndpoint) -> Result<String, RunnerError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
	model: &'a str,
	messages: Vec<ChatMessage<'a>>,
	temperature: f32,
	max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
	choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
	message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
	content: String,
}

pub struct OpenAiChatModel {
	client: reqwest::Client,
}

impl OpenAiChatModel {
	pub fn new() -> Self {
		Self { client: reqwest::Client::new() }
	}
}

impl Default for OpenAiChatModel {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
	async fn chat(&self, system: &str, user: &str, endpoint: &ModelEndpoint) -> Result<String, RunnerError> {
		let api_key = endpoint
			.api_key
			.as_deref()
			.ok_or_else(|| RunnerError::Transport(format!("no API key configured for {}", endpoint.display_name)))?;

		let url = format!("{}/chat/completions", endpoint.api_base.trim_end_matches('/'));
		let request = ChatRequest {
			model: &endpoint.model,
			messages: vec![
				ChatMessage { role: "system", content: system },
				ChatMessage { role: "user", content: user },
			],
			temperature: 0.7,
			max_tokens: 4000,
		};

		let response = self
			.client
			.post(&url)
			.bearer_auth(api_key)
			.json(&request)
			.timeout(Duration::from_secs(300))
			.send()
			.await
			.map_err(|e| RunnerError::Transport(e.to_string()))?;

		if !response.status().is_success() {
			return Err(RunnerError::Transport(format!("{} returned {}", endpoint.display_name, response.status())));
		}

		let parsed: ChatResponse = response.json().await.map_err(|e| RunnerError::Transport(e.to_string()))?;
		parsed
			.choices
			.into_iter()
			.next()
			.map(|choice| choice.message.content)
			.ok_or_else(|| RunnerError::Transport("empty completion response".to_string()))
	}
}

#[derive(Serialize)]
struct SidecarRequest<'a> {
	audio_path: &'a Path,
	language: &'a str,
	hotword: &'a str,
}

#[derive(Deserialize)]
struct SidecarResponse {
	#[serde(default)]
	segments: Vec<Segment>,
	#[serde(default)]
	error: Option<String>,
}

/// Client for an out-of-process recognition runner. Progress inside the
/// sidecar is opaque, so only the submit and receive boundaries are
/// reported; the tracker interpolates between them.
pub struct HttpTranscriber {
	base_url: String,
	client: OnceLock<reqwest::blocking::Client>,
}

impl HttpTranscriber {
	pub fn new(base_url: String) -> Self {
		Self {
			base_url,
			client: OnceLock::new(),
		}
	}

	// Built lazily so construction happens on the blocking thread, never
	// inside the async runtime.
	fn client(&self) -> &reqwest::blocking::Client {
		self.client.get_or_init(reqwest::blocking::Client::new)
	}
}

impl Transcriber for HttpTranscriber {
	fn transcribe(&self, job: &TranscribeJob, cancel: CancelCheck<'_>, progress: ProgressFn<'_>) -> Result<Vec<Segment>, RunnerError> {
		if cancel() {
			return Err(RunnerError::Cancelled);
		}

		progress(ProgressUpdate {
			stage: "submit".to_string(),
			progress: 5,
			message: "提交转写任务".to_string(),
			eta_millis: None,
		});

		let url = format!("{}/transcribe", self.base_url.trim_end_matches('/'));
		let response = self
			.client()
			.post(&url)
			.json(&SidecarRequest {
				audio_path: &job.audio_path,
				language: job.language.as_str(),
				hotword: &job.hotword,
			})
			.send()
			.map_err(|e| RunnerError::Transport(e.to_string()))?;

		if cancel() {
			return Err(RunnerError::Cancelled);
		}

		if !response.status().is_success() {
			return Err(RunnerError::Transport(format!("runner returned {}", response.status())));
		}

		let parsed: SidecarResponse = response.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
		if let Some(error) = parsed.error {
			warn!("runner reported failure for {}: {error}", job.file_id);
			return Err(RunnerError::Failed(error));
		}

		progress(ProgressUpdate {
			stage: "receive".to_string(),
			progress: 95,
			message: "转写结果已返回".to_string(),
			eta_millis: Some(200),
		});

		Ok(parsed.segments)
	}
}
