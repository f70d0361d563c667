use crate::config::{Config, ModelKey};
use crate::error::VoiceHostError;
use crate::history::HistoryStore;
use crate::registry::{FileRegistry, FileState, Segment, Summary, SummaryStatus};
use crate::runner::{ChatModel, DocMeta, DocRenderer};
use crate::util::now_display;
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{info, warn};

const SYSTEM_MESSAGE: &str = "你是一个专业的会议纪要助手。重要规则：直接输出会议纪要内容，不要包含任何确认消息、引导语句、说明性文字或元信息（如'这是根据您提供的会议转录内容生成的会议纪要'、'好的'、'已根据'、'为您生成'等）。直接开始输出会议主题，不要添加任何前缀。";

const TRANSCRIPT_MARKER: &str = "会议转录内容：";

const HYGIENE_DIRECTIVE: &str = "\n\n重要要求：直接输出会议纪要内容，不要包含任何确认消息、引导语句或说明性文字（如'这是根据您提供的会议转录内容生成的会议纪要'、'好的'、'已根据'等）。不要添加任何前缀说明，直接开始输出。";

const DEFAULT_PROMPT_HEAD: &str = "请根据以下会议转录内容，生成一份结构化的会议纪要。\n\n会议转录内容：\n";

const DEFAULT_PROMPT_TAIL: &str = r#"

请严格按照以下格式生成会议纪要：

会议主题：[根据会议内容总结主题]
主持人：[从转录中识别主持人]
参会人数：[统计参与会议的总人数]
关键词：[会议纪要关键词]
大纲:[用200字左右阐述会议概要]

一、会议议题及讨论内容
二、行动清单（待办事项）
三、其他说明

重要要求：
1. 直接输出会议纪要内容，不要包含任何确认消息、引导语句或说明性文字
2. 不要添加任何前缀说明，直接开始输出会议主题
3. 不要使用"为您生成"、"已根据"、"这是"等引导性语句
4. 输出内容应该是纯粹的会议纪要，不包含任何元信息或确认信息
5. 关键词部分应提取会议中的核心专业术语、重要概念、关键议题等，用空格分隔，数量控制在10-20个之间"#;

/// Leading lines matching any of these are confirmation chatter, not
/// content. The set is heuristic and tunable; keep it closed and in one
/// place.
const CONFIRMATION_PATTERNS: [&str; 7] = [
	r"^(好的|明白了|收到|了解)[，,。\s]*",
	r"^(已根据|根据您提供|根据.*?转录|根据.*?内容)",
	r"^(为您生成|为您.*?生成|已.*?生成.*?会议纪要)",
	r"^(这是.*?生成的.*?会议纪要|这是根据.*?生成的)",
	r"^(以下是|下面.*?是|我将.*?为您)",
	r"^(根据.*?内容.*?生成|基于.*?内容.*?生成)",
	r"(为您|已为您|已经为您).*?(生成|创建|制作).*?(会议纪要|纪要)",
];

const CONTENT_START_PATTERN: &str = r"^(会议主题|会议时间|会议地点|主持人|记录人|参与人员|参会人数|一、|二、|三、)";

fn confirmation_regexes() -> &'static Vec<Regex> {
	static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
	PATTERNS.get_or_init(|| CONFIRMATION_PATTERNS.iter().map(|p| Regex::new(p).expect("confirmation pattern")).collect())
}

fn content_start_regex() -> &'static Regex {
	static PATTERN: OnceLock<Regex> = OnceLock::new();
	PATTERN.get_or_init(|| Regex::new(CONTENT_START_PATTERN).expect("content start pattern"))
}

/// Composes prompts, drives the chat model and persists cleaned summaries.
pub struct SummaryOrchestrator {
	config: Arc<Config>,
	registry: Arc<FileRegistry>,
	history: Arc<HistoryStore>,
	chat: Arc<dyn ChatModel>,
	renderer: Arc<dyn DocRenderer>,
}

impl SummaryOrchestrator {
	pub fn new(config: Arc<Config>, registry: Arc<FileRegistry>, history: Arc<HistoryStore>, chat: Arc<dyn ChatModel>, renderer: Arc<dyn DocRenderer>) -> Self {
		Self {
			config,
			registry,
			history,
			chat,
			renderer,
		}
	}

	/// Generate a summary for a completed file, store it on the record,
	/// render the document and persist history.
	pub async fn generate(&self, file_id: &str, prompt: Option<String>, model: Option<String>) -> Result<Summary, VoiceHostError> {
		let record = self.registry.get(file_id).map_err(|_| VoiceHostError::NotFound)?;
		if record.state != FileState::Completed {
			return Err(VoiceHostError::validation("文件转写未完成"));
		}
		let segments = record.segments.clone().filter(|s| !s.is_empty()).ok_or_else(|| VoiceHostError::validation("没有转写结果"))?;

		let summary = self.run_model(&segments, prompt.as_deref(), model.as_deref()).await?;

		self.registry.update(file_id, |r| r.summary = Some(summary.clone()))?;

		let meta = DocMeta {
			file_id: record.id.clone(),
			short_id: record.short_id(),
			original_name: record.original_name.clone(),
			language: record.language,
			audio_duration: segments.last().map(|s| s.end_time),
		};
		let rendered = {
			let renderer = Arc::clone(&self.renderer);
			let summary = summary.clone();
			let segments = segments.clone();
			tokio::task::spawn_blocking(move || renderer.render_summary(&segments, &summary, &meta)).await
		};
		match rendered {
			Ok(Ok(path)) => {
				self.registry.update(file_id, |r| r.summary_doc = Some(path.clone()))?;
			}
			Ok(Err(e)) => warn!("summary render failed for {file_id}: {e}"),
			Err(e) => warn!("summary render task failed for {file_id}: {e}"),
		}

		let history = Arc::clone(&self.history);
		let completed = self.registry.completed_records();
		if let Err(e) = tokio::task::spawn_blocking(move || history.save(&completed))
			.await
			.unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
		{
			warn!("history save failed after summary for {file_id}: {e}");
		}

		Ok(summary)
	}

	async fn run_model(&self, segments: &[Segment], prompt: Option<&str>, model: Option<&str>) -> Result<Summary, VoiceHostError> {
		let transcript = join_transcript(segments);
		if transcript.trim().is_empty() {
			return Err(VoiceHostError::validation("转写文本为空，无法生成会议纪要"));
		}

		let key = ModelKey::resolve(model);
		let endpoint = self.config.model_endpoint(key);
		if endpoint.api_key.is_none() {
			info!("no API key configured for {}, falling back to the default template", endpoint.display_name);
			return Ok(default_summary(segments));
		}

		let user_message = compose_prompt(prompt, &transcript);
		info!("generating summary with {} over {} transcript chars", endpoint.display_name, transcript.chars().count());

		match self.chat.chat(SYSTEM_MESSAGE, &user_message, &endpoint).await {
			Ok(reply) => Ok(Summary {
				raw_text: clean_reply(&reply),
				generated_at: now_display(),
				model_key: endpoint.key.as_str().to_string(),
				status: SummaryStatus::Success,
				error: None,
			}),
			// Transport failures surface on this record only.
			Err(e) => {
				warn!("summary model call failed: {e}");
				Ok(Summary {
					raw_text: format!("生成会议纪要时发生错误: {e}"),
					generated_at: now_display(),
					model_key: endpoint.key.as_str().to_string(),
					status: SummaryStatus::Error,
					error: Some(e.to_string()),
				})
			}
		}
	}
}

fn join_transcript(segments: &[Segment]) -> String {
	let mut text = String::new();
	for segment in segments {
		let speaker = if segment.speaker.is_empty() { "未知发言人" } else { &segment.speaker };
		text.push_str(&format!("{speaker}: {}\n\n", segment.text));
	}
	text
}

/// Build the user message: substitute the `{transcript}` placeholder when
/// present, otherwise attach the transcript at the marker or the end, and
/// make sure the output-hygiene directive is stated once.
fn compose_prompt(custom: Option<&str>, transcript: &str) -> String {
	let Some(custom) = custom.filter(|p| !p.trim().is_empty()) else {
		return format!("{DEFAULT_PROMPT_HEAD}{transcript}{DEFAULT_PROMPT_TAIL}");
	};

	let mut prompt = if custom.contains("{transcript}") {
		custom.replace("{transcript}", transcript)
	} else if custom.contains(TRANSCRIPT_MARKER) {
		custom.replace(TRANSCRIPT_MARKER, &format!("{TRANSCRIPT_MARKER}\n{transcript}"))
	} else {
		format!("{custom}\n\n{TRANSCRIPT_MARKER}\n{transcript}")
	};

	if !prompt.contains("不要包含任何确认消息") && !prompt.contains("不要添加任何前缀说明") {
		prompt.push_str(HYGIENE_DIRECTIVE);
	}
	prompt
}

/// Strip confirmation chatter and markdown decoration from a model reply.
pub fn clean_reply(raw: &str) -> String {
	let confirmations = confirmation_regexes();
	let content_start = content_start_regex();

	let mut lines: Vec<&str> = Vec::new();
	let mut skipping = true;
	for line in raw.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			if !skipping {
				lines.push(line);
			}
			continue;
		}
		if confirmations.iter().any(|re| re.is_match(trimmed)) {
			skipping = true;
			continue;
		}
		if content_start.is_match(trimmed) {
			skipping = false;
			lines.push(line);
		} else if !skipping {
			lines.push(line);
		} else if trimmed.chars().count() > 20 && !["根据", "生成", "为您", "已", "这是"].iter().any(|k| trimmed.contains(k)) {
			skipping = false;
			lines.push(line);
		}
	}
	let text = lines.join("\n");

	static MARKDOWN_RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
	let rules = MARKDOWN_RULES.get_or_init(|| {
		vec![
			(Regex::new(r"(?m)^[-=]{3,}\s*$").expect("rule pattern"), ""),
			(Regex::new(r"(?m)^#{1,6}\s*\*{0,2}\s*会议纪要\s*\*{0,2}\s*$").expect("rule pattern"), ""),
			(Regex::new(r"(?m)^#{1,6}\s+").expect("rule pattern"), ""),
			(Regex::new(r"\*\*([^*]+)\*\*").expect("rule pattern"), "$1"),
			(Regex::new(r"(?m)^\s*会议纪要\s*$").expect("rule pattern"), ""),
			(Regex::new(r"\*([^*]+)\*").expect("rule pattern"), "$1"),
			(Regex::new(r"(?s)```.*?```").expect("rule pattern"), ""),
			(Regex::new(r"`([^`]+)`").expect("rule pattern"), "$1"),
			(Regex::new(r"(?m)^\s*[-*]\s+").expect("rule pattern"), ""),
			(Regex::new(r"(?m)^\s*\d+\.\s+").expect("rule pattern"), ""),
		]
	});

	let mut text = text;
	for (re, replacement) in rules {
		text = re.replace_all(&text, *replacement).into_owned();
	}

	static BLANK_COLLAPSE: OnceLock<Regex> = OnceLock::new();
	let collapse = BLANK_COLLAPSE.get_or_init(|| Regex::new(r"\n{3,}").expect("collapse pattern"));
	text = collapse.replace_all(&text, "\n\n").into_owned();

	text.trim().to_string()
}

/// Deterministic fallback used when no chat backend is configured: basic
/// per-speaker statistics over the transcript.
pub fn default_summary(segments: &[Segment]) -> Summary {
	let mut speakers: Vec<(String, usize, usize)> = Vec::new();
	let mut total_chars = 0usize;

	for segment in segments {
		let name = if segment.speaker.is_empty() { "未知发言人".to_string() } else { segment.speaker.clone() };
		let chars = segment.text.chars().count();
		total_chars += chars;
		match speakers.iter_mut().find(|(speaker, _, _)| *speaker == name) {
			Some((_, count, words)) => {
				*count += 1;
				*words += chars;
			}
			None => speakers.push((name, 1, chars)),
		}
	}

	let mut text = format!(
		"## 会议概要\n本次会议共有{}位参与者，会议记录共{}段发言，总计约{}字。\n\n## 参与人员\n",
		speakers.len(),
		segments.len(),
		total_chars
	);
	for (speaker, count, _) in &speakers {
		text.push_str(&format!("- {speaker}: 发言{count}次\n"));
	}

	Summary {
		raw_text: text,
		generated_at: now_display(),
		model_key: "default_template".to_string(),
		status: SummaryStatus::Success,
		error: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ModelEndpoint;
	use crate::registry::FileRecord;
	use crate::runner::{PlainDocRenderer, RunnerError};
	use async_trait::async_trait;
	use clap::Parser;
	use std::path::PathBuf;

	fn segments() -> Vec<Segment> {
		vec![
			Segment {
				speaker: "发言人1".to_string(),
				text: "今天讨论季度计划。".to_string(),
				start_time: 0.0,
				end_time: 5.0,
				words: None,
			},
			Segment {
				speaker: "发言人2".to_string(),
				text: "预算需要重新评估。".to_string(),
				start_time: 5.0,
				end_time: 9.0,
				words: None,
			},
			Segment {
				speaker: "发言人1".to_string(),
				text: "下周给出结论。".to_string(),
				start_time: 9.0,
				end_time: 12.0,
				words: None,
			},
		]
	}

	#[test]
	fn prompt_placeholder_is_substituted() {
		let prompt = compose_prompt(Some("总结一下：{transcript}，谢谢"), "A: 内容");
		assert!(prompt.contains("A: 内容"));
		assert!(!prompt.contains("{transcript}"));
		assert!(prompt.contains("不要包含任何确认消息"));
	}

	#[test]
	fn prompt_marker_gets_transcript_appended() {
		let prompt = compose_prompt(Some("请生成纪要。会议转录内容："), "A: 内容");
		assert!(prompt.contains("会议转录内容：\nA: 内容"));
	}

	#[test]
	fn prompt_without_hooks_appends_with_header() {
		let prompt = compose_prompt(Some("请生成纪要"), "A: 内容");
		assert!(prompt.starts_with("请生成纪要"));
		assert!(prompt.contains("会议转录内容：\nA: 内容"));
	}

	#[test]
	fn hygiene_directive_is_not_duplicated() {
		let custom = format!("提示词{HYGIENE_DIRECTIVE}");
		let prompt = compose_prompt(Some(&custom), "A: 内容");
		assert_eq!(prompt.matches("不要包含任何确认消息").count(), 1);
	}

	#[test]
	fn default_prompt_is_used_when_custom_is_absent() {
		let prompt = compose_prompt(None, "A: 内容");
		assert!(prompt.starts_with("请根据以下会议转录内容"));
		assert!(prompt.contains("A: 内容"));
		assert!(prompt.contains("关键词部分应提取"));
	}

	#[test]
	fn clean_reply_strips_confirmations_and_markdown() {
		let raw = "好的，已根据您提供的会议转录内容生成会议纪要。\n\n# 会议纪要\n\n会议主题：**季度计划**\n- 预算评估\n1. 下周结论\n\n\n\n`结束`";
		let cleaned = clean_reply(raw);
		assert!(cleaned.starts_with("会议主题：季度计划"));
		assert!(!cleaned.contains("已根据"));
		assert!(!cleaned.contains("**"));
		assert!(!cleaned.contains("- "));
		assert!(!cleaned.contains('`'));
		assert!(!cleaned.contains("\n\n\n"));
	}

	#[test]
	fn clean_reply_drops_standalone_title_lines() {
		let raw = "会议主题：计划\n\n会议纪要\n\n一、议题";
		let cleaned = clean_reply(raw);
		assert!(!cleaned.contains("会议纪要\n"));
		assert!(cleaned.contains("一、议题"));
	}

	#[test]
	fn default_summary_counts_speakers_and_segments() {
		let summary = default_summary(&segments());
		assert_eq!(summary.model_key, "default_template");
		assert_eq!(summary.status, SummaryStatus::Success);
		assert!(summary.raw_text.contains("共有2位参与者"));
		assert!(summary.raw_text.contains("共3段发言"));
		assert!(summary.raw_text.contains("- 发言人1: 发言2次"));
	}

	struct CannedChat {
		reply: Result<String, String>,
	}

	#[async_trait]
	impl ChatModel for CannedChat {
		async fn chat(&self, _system: &str, _user: &str, _endpoint: &ModelEndpoint) -> Result<String, RunnerError> {
			self.reply.clone().map_err(RunnerError::Transport)
		}
	}

	struct Fixture {
		orchestrator: SummaryOrchestrator,
		registry: Arc<FileRegistry>,
		_dir: tempfile::TempDir,
	}

	fn fixture(with_key: bool, reply: Result<String, String>) -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let mut config = Config::parse_from(["voice_host"]);
		config.deepseek_api_key = if with_key { Some("test-key".to_string()) } else { None };
		let registry = Arc::new(FileRegistry::new());
		let history = Arc::new(HistoryStore::new(dir.path()));
		let renderer = Arc::new(PlainDocRenderer::new(dir.path().to_path_buf(), dir.path().to_path_buf()));
		let orchestrator = SummaryOrchestrator::new(Arc::new(config), Arc::clone(&registry), history, Arc::new(CannedChat { reply }), renderer);
		Fixture {
			orchestrator,
			registry,
			_dir: dir,
		}
	}

	fn add_completed(registry: &FileRegistry, id: &str) {
		let record = FileRecord::new(id.to_string(), format!("{id}.mp3"), format!("{id}_s.mp3"), PathBuf::from("/tmp/x.mp3"), 10);
		registry.add(record).unwrap();
		registry.update(id, |r| r.state = FileState::Processing).unwrap();
		registry
			.update(id, |r| {
				r.state = FileState::Completed;
				r.progress = 100;
				r.segments = Some(segments());
			})
			.unwrap();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn missing_api_key_falls_back_to_template() {
		let f = fixture(false, Ok(String::new()));
		add_completed(&f.registry, "a");

		let summary = f.orchestrator.generate("a", None, None).await.unwrap();
		assert_eq!(summary.model_key, "default_template");

		let record = f.registry.get("a").unwrap();
		assert!(record.summary.is_some());
		assert!(record.summary_doc.is_some());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn chat_reply_is_cleaned_and_stored() {
		let f = fixture(true, Ok("好的，已为您生成会议纪要。\n会议主题：**预算**\n一、议题".to_string()));
		add_completed(&f.registry, "a");

		let summary = f.orchestrator.generate("a", Some("自定义提示".to_string()), Some("deepseek-chat".to_string())).await.unwrap();
		assert_eq!(summary.status, SummaryStatus::Success);
		assert_eq!(summary.model_key, "deepseek");
		assert!(summary.raw_text.starts_with("会议主题：预算"));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn transport_failure_yields_an_error_summary() {
		let f = fixture(true, Err("connection refused".to_string()));
		add_completed(&f.registry, "a");

		let summary = f.orchestrator.generate("a", None, None).await.unwrap();
		assert_eq!(summary.status, SummaryStatus::Error);
		assert!(summary.error.is_some());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn generate_requires_a_completed_file_with_segments() {
		let f = fixture(true, Ok(String::new()));
		assert!(matches!(f.orchestrator.generate("missing", None, None).await, Err(VoiceHostError::NotFound)));

		let record = FileRecord::new("u".to_string(), "u.mp3".to_string(), "u_s.mp3".to_string(), PathBuf::from("/tmp/u.mp3"), 1);
		f.registry.add(record).unwrap();
		assert!(f.orchestrator.generate("u", None, None).await.is_err());
	}
}
