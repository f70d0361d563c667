use crate::error::VoiceHostError;
use crate::history::HistoryStore;
use crate::progress::ProgressTracker;
use crate::registry::{FileRecord, FileRegistry, FileState, Language, Segment};
use crate::runner::{DocMeta, DocRenderer, Normalizer, RunnerError, TranscribeJob, Transcriber};
use crate::util::now_display;
use crate::websocket::{EventStatus, FileStatusEvent, StatusPublisher};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

const STOPPED_MESSAGE: &str = "转写已停止";

/// How often the blocking wait mode re-checks job states.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A submitted transcription batch.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
	pub file_ids: Vec<String>,
	pub language: Language,
	pub hotword: String,
	pub wait: bool,
	pub timeout: Duration,
}

/// Per-file view returned from blocking submissions.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
	pub file_id: String,
	pub filename: String,
	pub status: FileState,
	pub progress: u8,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub upload_time: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub complete_time: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transcript: Option<Vec<Segment>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl FileOutcome {
	fn from_record(record: &FileRecord) -> Self {
		Self {
			file_id: record.id.clone(),
			filename: record.original_name.clone(),
			status: record.state,
			progress: record.progress,
			upload_time: Some(record.upload_time.clone()),
			complete_time: record.complete_time.clone(),
			// The blocking response strips per-word timings; the full
			// transcript stays available through the result endpoint.
			transcript: record.segments.as_ref().map(|segments| segments.iter().map(Segment::without_words).collect()),
			error_message: if record.error_message.is_empty() {
				None
			} else {
				Some(record.error_message.clone())
			},
		}
	}
}

#[derive(Debug)]
pub enum SubmitOutcome {
	/// Fire-and-forget acceptance.
	Started { file_ids: Vec<String> },
	/// Every job reached a terminal state before the deadline.
	Finished {
		completed: Vec<String>,
		failed: Vec<String>,
		results: Vec<FileOutcome>,
	},
	/// The deadline passed first. The three id lists partition the batch.
	TimedOut {
		completed: Vec<String>,
		failed: Vec<String>,
		pending: Vec<String>,
		results: Vec<FileOutcome>,
	},
}

/// Handle to an enqueued job. Cancellation is cooperative: the flag is read
/// by the worker at stage boundaries.
pub struct JobHandle {
	file_id: String,
	registry: Arc<FileRegistry>,
}

impl JobHandle {
	pub fn file_id(&self) -> &str {
		&self.file_id
	}

	/// Request cancellation. Safe to call repeatedly; later calls are no-ops.
	pub fn cancel(&self) {
		let _ = self.registry.update(&self.file_id, |record| record.cancelled = true);
	}
}

/// Dispatches transcription jobs to a bounded worker pool, owns cooperative
/// cancellation and persists results.
pub struct TranscriptionScheduler {
	registry: Arc<FileRegistry>,
	history: Arc<HistoryStore>,
	publisher: StatusPublisher,
	transcriber: Arc<dyn Transcriber>,
	normalizer: Arc<dyn Normalizer>,
	renderer: Arc<dyn DocRenderer>,
	permits: Arc<Semaphore>,
	active: Arc<DashMap<String, JoinHandle<()>>>,
}

impl TranscriptionScheduler {
	pub fn new(
		registry: Arc<FileRegistry>,
		history: Arc<HistoryStore>,
		publisher: StatusPublisher,
		transcriber: Arc<dyn Transcriber>,
		normalizer: Arc<dyn Normalizer>,
		renderer: Arc<dyn DocRenderer>,
		workers: usize,
	) -> Self {
		Self {
			registry,
			history,
			publisher,
			transcriber,
			normalizer,
			renderer,
			permits: Arc::new(Semaphore::new(workers.max(1))),
			active: Arc::new(DashMap::new()),
		}
	}

	/// Submit a batch. All ids are validated before any state changes, so a
	/// bad id rejects the whole call without side effects.
	pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, VoiceHostError> {
		if request.file_ids.is_empty() {
			return Err(VoiceHostError::validation("请选择要转写的文件（file_id 或 file_ids）"));
		}

		for id in &request.file_ids {
			let record = self
				.registry
				.get(id)
				.map_err(|_| VoiceHostError::validation(format!("文件ID {id} 不存在")))?;
			if self.is_busy(&record) {
				return Err(VoiceHostError::conflict(format!("文件 {} 正在处理中", record.original_name)));
			}
		}

		for id in &request.file_ids {
			let record = self.registry.update(id, |record| {
				record.state = FileState::Processing;
				record.progress = 0;
				record.language = request.language;
				record.cancelled = false;
				record.error_message.clear();
			})?;
			self.publisher.publish(FileStatusEvent::new(
				id,
				EventStatus::Processing,
				0,
				format!("开始转写: {}", record.original_name),
			));
			self.enqueue(id.clone(), request.language, request.hotword.clone());
		}
		info!("submitted {} transcription jobs", request.file_ids.len());

		if !request.wait {
			return Ok(SubmitOutcome::Started {
				file_ids: request.file_ids,
			});
		}

		Ok(self.wait_for(&request.file_ids, request.timeout).await)
	}

	/// Enqueue a single job and hand back its cancellation handle.
	pub fn enqueue(&self, file_id: String, language: Language, hotword: String) -> JobHandle {
		let handle = JobHandle {
			file_id: file_id.clone(),
			registry: Arc::clone(&self.registry),
		};

		let ctx = JobContext {
			registry: Arc::clone(&self.registry),
			history: Arc::clone(&self.history),
			publisher: self.publisher.clone(),
			transcriber: Arc::clone(&self.transcriber),
			normalizer: Arc::clone(&self.normalizer),
			renderer: Arc::clone(&self.renderer),
		};
		let permits = Arc::clone(&self.permits);
		let active = Arc::clone(&self.active);
		let task_id = file_id.clone();

		let task = tokio::spawn(async move {
			// Fair semaphore: jobs start in submission order.
			let permit = permits.acquire_owned().await;
			if permit.is_ok() {
				run_job(&ctx, &task_id, language, &hotword).await;
			}
			active.remove(&task_id);
		});
		self.active.insert(file_id, task);

		handle
	}

	/// Cooperative stop. The record is handed back to `uploaded`
	/// immediately; the running worker observes the flag and discards its
	/// result.
	pub fn stop(&self, file_id: &str) -> Result<(), VoiceHostError> {
		let record = self.registry.get(file_id).map_err(|_| VoiceHostError::NotFound)?;
		if record.state != FileState::Processing {
			return Err(VoiceHostError::validation("文件未在转写中"));
		}

		if let Err(e) = self.registry.update(file_id, |record| {
			record.cancelled = true;
			record.state = FileState::Uploaded;
			record.progress = 0;
			record.error_message = STOPPED_MESSAGE.to_string();
		}) {
			// The worker finished in the same instant; cancellation lost
			// the race and the terminal state stands.
			info!("stop for {file_id} arrived after completion: {e}");
			return Err(VoiceHostError::validation("文件未在转写中"));
		}
		self.publisher
			.publish(FileStatusEvent::new(file_id, EventStatus::Uploaded, 0, STOPPED_MESSAGE));
		info!("stop requested for {file_id}");
		Ok(())
	}

	/// Re-run a finished or failed file. Refused while a job is in flight.
	pub fn retranscribe(&self, file_id: &str, language: Language, hotword: String) -> Result<(), VoiceHostError> {
		let record = self.registry.get(file_id).map_err(|_| VoiceHostError::NotFound)?;
		if self.is_busy(&record) {
			return Err(VoiceHostError::conflict("文件正在处理中"));
		}

		self.registry.update(file_id, |record| {
			record.state = FileState::Processing;
			record.progress = 0;
			record.language = language;
			record.cancelled = false;
			record.error_message.clear();
		})?;
		self.publisher.publish(FileStatusEvent::new(
			file_id,
			EventStatus::Processing,
			0,
			format!("开始重新转写: {}", record.original_name),
		));
		self.enqueue(file_id.to_string(), language, hotword);
		Ok(())
	}

	pub fn is_active(&self, file_id: &str) -> bool {
		self.active.contains_key(file_id)
	}

	/// A file is busy while its record is processing, or while a stopped
	/// job's worker is still winding down. A terminal record is free even
	/// if the old task has not fully torn down yet.
	fn is_busy(&self, record: &FileRecord) -> bool {
		record.state == FileState::Processing || (!record.state.is_terminal() && self.active.contains_key(&record.id))
	}

	async fn wait_for(&self, file_ids: &[String], timeout: Duration) -> SubmitOutcome {
		let deadline = Instant::now() + timeout;
		let mut pending: Vec<String> = file_ids.to_vec();
		let mut completed = Vec::new();
		let mut failed = Vec::new();

		loop {
			pending.retain(|id| match self.registry.get(id) {
				Ok(record) if record.state == FileState::Completed => {
					completed.push(id.clone());
					false
				}
				Ok(record) if record.state == FileState::Error => {
					failed.push(id.clone());
					false
				}
				// Deleted mid-run counts as failed rather than blocking the
				// caller until the deadline.
				Err(_) => {
					failed.push(id.clone());
					false
				}
				Ok(_) => true,
			});

			if pending.is_empty() || Instant::now() >= deadline {
				break;
			}
			tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - Instant::now())).await;
		}

		let results: Vec<FileOutcome> = completed
			.iter()
			.chain(failed.iter())
			.filter_map(|id| self.registry.get(id).ok())
			.map(|record| FileOutcome::from_record(&record))
			.collect();

		if pending.is_empty() {
			SubmitOutcome::Finished { completed, failed, results }
		} else {
			SubmitOutcome::TimedOut {
				completed,
				failed,
				pending,
				results,
			}
		}
	}
}

struct JobContext {
	registry: Arc<FileRegistry>,
	history: Arc<HistoryStore>,
	publisher: StatusPublisher,
	transcriber: Arc<dyn Transcriber>,
	normalizer: Arc<dyn Normalizer>,
	renderer: Arc<dyn DocRenderer>,
}

enum RunOutcome {
	Success(Vec<Segment>),
	Cancelled,
	Failed(String),
}

async fn run_job(ctx: &JobContext, file_id: &str, language: Language, hotword: &str) {
	let record = match ctx.registry.get(file_id) {
		Ok(record) => record,
		// Deleted while queued.
		Err(_) => return,
	};

	if record.cancelled {
		info!("job {file_id} cancelled before start");
		let _ = ctx.registry.update(file_id, |r| {
			r.state = FileState::Uploaded;
			r.progress = 0;
			r.error_message = STOPPED_MESSAGE.to_string();
		});
		ctx.publisher
			.publish(FileStatusEvent::new(file_id, EventStatus::Uploaded, 0, STOPPED_MESSAGE));
		return;
	}

	let tracker = Arc::new(ProgressTracker::new(file_id, ctx.publisher.clone()));

	let job = TranscribeJob {
		file_id: file_id.to_string(),
		audio_path: record.stored_path.clone(),
		language,
		hotword: hotword.to_string(),
	};

	let run = tokio::task::spawn_blocking({
		let transcriber = Arc::clone(&ctx.transcriber);
		let normalizer = Arc::clone(&ctx.normalizer);
		let registry = Arc::clone(&ctx.registry);
		let tracker = Arc::clone(&tracker);
		move || {
			let cancel = || registry.get(&job.file_id).map(|r| r.cancelled).unwrap_or(true);
			let progress = |update: crate::runner::ProgressUpdate| {
				// A stopped job goes quiet immediately, even if the runner
				// keeps reporting until its next cancellation poll.
				if cancel() {
					return;
				}
				let message = if update.message.is_empty() {
					format!("处理中: {}", update.stage)
				} else {
					update.message
				};
				tracker.set_target(update.progress, message, update.eta_millis);
			};
			// Pre-processing is a no-op when the audio already conforms.
			let audio_path = normalizer.normalize(&job.audio_path)?;
			let job = TranscribeJob { audio_path, ..job.clone() };
			transcriber.transcribe(&job, &cancel, &progress)
		}
	})
	.await;

	let cancelled_now = ctx.registry.get(file_id).map(|r| r.cancelled).unwrap_or(true);
	let outcome = match run {
		Err(join_error) => RunOutcome::Failed(format!("转写线程异常: {join_error}")),
		Ok(Err(RunnerError::Cancelled)) => RunOutcome::Cancelled,
		Ok(Err(e)) if cancelled_now => {
			info!("job {file_id} failed after cancellation, treating as cancelled: {e}");
			RunOutcome::Cancelled
		}
		Ok(Err(e)) => RunOutcome::Failed(e.to_string()),
		// A runner that never observed the flag still loses the race here:
		// a cancelled job's result is discarded.
		Ok(Ok(_)) if cancelled_now => RunOutcome::Cancelled,
		Ok(Ok(segments)) if segments.is_empty() => RunOutcome::Failed("转写失败".to_string()),
		Ok(Ok(segments)) => RunOutcome::Success(segments),
	};

	match outcome {
		RunOutcome::Success(segments) => complete_job(ctx, file_id, &record, language, segments, &tracker).await,
		RunOutcome::Cancelled => {
			info!("job {file_id} cancelled");
			if ctx.registry.contains(file_id) {
				let _ = ctx.registry.update(file_id, |r| {
					r.state = FileState::Uploaded;
					r.progress = 0;
					r.error_message = STOPPED_MESSAGE.to_string();
				});
				tracker.finish(EventStatus::Uploaded, 0, STOPPED_MESSAGE).await;
			}
		}
		RunOutcome::Failed(message) => {
			error!("job {file_id} failed: {message}");
			let _ = ctx.registry.update(file_id, |r| {
				r.state = FileState::Error;
				r.error_message = message.clone();
			});
			tracker.finish(EventStatus::Error, 0, format!("处理失败: {message}")).await;
		}
	}
}

async fn complete_job(ctx: &JobContext, file_id: &str, record: &FileRecord, language: Language, segments: Vec<Segment>, tracker: &ProgressTracker) {
	let meta = DocMeta {
		file_id: file_id.to_string(),
		short_id: record.short_id(),
		original_name: record.original_name.clone(),
		language,
		audio_duration: segments.last().map(|s| s.end_time),
	};

	// A failed render does not fail the job; the document can be rebuilt
	// on demand at download time.
	let document = {
		let renderer = Arc::clone(&ctx.renderer);
		let segments = segments.clone();
		tokio::task::spawn_blocking(move || renderer.render_transcript(&segments, &meta)).await
	};
	let transcript_doc = match document {
		Ok(Ok(path)) => Some(path),
		Ok(Err(e)) => {
			warn!("transcript render failed for {file_id}: {e}");
			None
		}
		Err(e) => {
			warn!("transcript render task failed for {file_id}: {e}");
			None
		}
	};

	let committed = ctx.registry.update(file_id, |r| {
		r.segments = Some(segments.clone());
		r.transcript_doc = transcript_doc.clone();
		r.state = FileState::Completed;
		r.progress = 100;
		r.complete_time = Some(now_display());
		r.error_message.clear();
	});

	match committed {
		Ok(updated) => {
			let history = Arc::clone(&ctx.history);
			let completed = ctx.registry.completed_records();
			if let Err(e) = tokio::task::spawn_blocking(move || history.save(&completed)).await.unwrap_or_else(|e| {
				Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
			}) {
				warn!("history save failed after {file_id}: {e}");
			}
			info!("job {file_id} completed with {} segments", segments.len());
			tracker
				.finish(EventStatus::Completed, 100, format!("转写完成: {}", updated.original_name))
				.await;
		}
		// A stop raced the result in; the record is already back in
		// `uploaded` and the commit was rejected. The stop's event stands.
		Err(e) => {
			info!("completion for {file_id} discarded: {e}");
			tracker.finish(EventStatus::Uploaded, 0, STOPPED_MESSAGE).await;
		}
	}
}
