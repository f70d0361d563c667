use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
	/// Use JSON formatting for tracing
	#[arg(long, env = "LOG_JSON", default_value = "false")]
	pub log_json: bool,

	/// Log filter
	#[arg(long, env = "RUST_LOG")]
	pub rust_log: Option<String>,

	/// Server host
	#[arg(long, env = "HOST", default_value = "0.0.0.0")]
	pub host: String,

	/// Server port
	#[arg(long, env = "PORT", default_value = "8000")]
	pub port: u16,

	/// Directory for uploaded audio
	#[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
	pub upload_dir: PathBuf,

	/// Directory for transcript documents and the history file
	#[arg(long, env = "OUTPUT_DIR", default_value = "transcripts")]
	pub output_dir: PathBuf,

	/// Directory for meeting summary documents
	#[arg(long, env = "SUMMARY_DIR", default_value = "meeting_summaries")]
	pub summary_dir: PathBuf,

	/// Number of concurrent transcription jobs
	#[arg(long, env = "TRANSCRIPTION_WORKERS", default_value = "12")]
	pub transcription_workers: usize,

	/// Default hotword list, space separated
	#[arg(long, env = "HOTWORD", default_value = "")]
	pub hotword: String,

	/// Default deadline for blocking transcribe calls, in seconds
	#[arg(long, env = "TASK_TIMEOUT", default_value = "3600")]
	pub task_timeout: u64,

	/// Transcription runner endpoint
	#[arg(long, env = "RUNNER_URL", default_value = "http://127.0.0.1:9100")]
	pub runner_url: String,

	/// DeepSeek API key
	#[arg(long, env = "DEEPSEEK_API_KEY")]
	pub deepseek_api_key: Option<String>,

	/// DeepSeek API base URL
	#[arg(long, env = "DEEPSEEK_API_BASE", default_value = "https://api.deepseek.com")]
	pub deepseek_api_base: String,

	/// DeepSeek model name
	#[arg(long, env = "DEEPSEEK_MODEL", default_value = "deepseek-chat")]
	pub deepseek_model: String,

	/// Qwen API key
	#[arg(long, env = "QWEN_API_KEY")]
	pub qwen_api_key: Option<String>,

	/// Qwen API base URL
	#[arg(long, env = "QWEN_API_BASE", default_value = "https://dashscope.aliyuncs.com/compatible-mode/v1")]
	pub qwen_api_base: String,

	/// Qwen model name
	#[arg(long, env = "QWEN_MODEL", default_value = "qwen-turbo")]
	pub qwen_model: String,

	/// GLM API key
	#[arg(long, env = "GLM_API_KEY")]
	pub glm_api_key: Option<String>,

	/// GLM API base URL
	#[arg(long, env = "GLM_API_BASE", default_value = "https://open.bigmodel.cn/api/paas/v4")]
	pub glm_api_base: String,

	/// GLM model name
	#[arg(long, env = "GLM_MODEL", default_value = "glm-4")]
	pub glm_model: String,
}

/// Configured summary model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKey {
	Deepseek,
	Qwen,
	Glm,
}

impl ModelKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Deepseek => "deepseek",
			Self::Qwen => "qwen",
			Self::Glm => "glm",
		}
	}

	/// Resolve a caller-supplied model name by substring, falling back to
	/// the platform default when the name is unknown or absent.
	pub fn resolve(model: Option<&str>) -> Self {
		let lower = model.unwrap_or_default().to_lowercase();
		if lower.contains("qwen") {
			Self::Qwen
		} else if lower.contains("glm") {
			Self::Glm
		} else {
			Self::Deepseek
		}
	}
}

/// Endpoint coordinates for one chat model.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
	pub key: ModelKey,
	pub api_key: Option<String>,
	pub api_base: String,
	pub model: String,
	pub display_name: &'static str,
}

impl Config {
	pub fn model_endpoint(&self, key: ModelKey) -> ModelEndpoint {
		match key {
			ModelKey::Deepseek => ModelEndpoint {
				key,
				api_key: self.deepseek_api_key.clone(),
				api_base: self.deepseek_api_base.clone(),
				model: self.deepseek_model.clone(),
				display_name: "Deepseek",
			},
			ModelKey::Qwen => ModelEndpoint {
				key,
				api_key: self.qwen_api_key.clone(),
				api_base: self.qwen_api_base.clone(),
				model: self.qwen_model.clone(),
				display_name: "Qwen",
			},
			ModelKey::Glm => ModelEndpoint {
				key,
				api_key: self.glm_api_key.clone(),
				api_base: self.glm_api_base.clone(),
				model: self.glm_model.clone(),
				display_name: "GLM",
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn model_key_resolution_matches_by_substring() {
		assert_eq!(ModelKey::resolve(Some("deepseek-chat")), ModelKey::Deepseek);
		assert_eq!(ModelKey::resolve(Some("Qwen-Turbo")), ModelKey::Qwen);
		assert_eq!(ModelKey::resolve(Some("glm-4-plus")), ModelKey::Glm);
		assert_eq!(ModelKey::resolve(Some("gpt-4o")), ModelKey::Deepseek);
		assert_eq!(ModelKey::resolve(None), ModelKey::Deepseek);
	}
}
