use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Lifecycle state of an uploaded audio file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
	Uploaded,
	Processing,
	Completed,
	Error,
}

impl FileState {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Uploaded => "uploaded",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Error => "error",
		}
	}

	/// List ordering: processing first, errors last.
	fn priority(&self) -> u8 {
		match self {
			Self::Processing => 0,
			Self::Uploaded => 1,
			Self::Completed => 2,
			Self::Error => 3,
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Error)
	}
}

impl std::fmt::Display for FileState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
	#[default]
	#[serde(rename = "zh")]
	Zh,
	#[serde(rename = "zh-en")]
	ZhEn,
	#[serde(rename = "zh-dialect")]
	ZhDialect,
	#[serde(rename = "en")]
	En,
}

impl Language {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Zh => "zh",
			Self::ZhEn => "zh-en",
			Self::ZhDialect => "zh-dialect",
			Self::En => "en",
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::Zh => "中文普通话",
			Self::ZhEn => "中英混合",
			Self::ZhDialect => "方言混合",
			Self::En => "英文",
		}
	}

	pub fn description(&self) -> &'static str {
		match self {
			Self::Zh => "适用于标准普通话音频",
			Self::ZhEn => "适用于中英文混合的音频",
			Self::ZhDialect => "适用于包含方言(如粤语、闽南语等)的音频",
			Self::En => "适用于纯英文音频",
		}
	}

	pub fn all() -> [Language; 4] {
		[Self::Zh, Self::ZhDialect, Self::ZhEn, Self::En]
	}
}

impl std::str::FromStr for Language {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"zh" => Ok(Self::Zh),
			"zh-en" => Ok(Self::ZhEn),
			"zh-dialect" => Ok(Self::ZhDialect),
			"en" => Ok(Self::En),
			other => Err(format!("unsupported language: {other}")),
		}
	}
}

/// Per-word timing inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
	pub text: String,
	pub start: f64,
	pub end: f64,
}

/// A speaker-attributed utterance produced by the recognition runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
	#[serde(default)]
	pub speaker: String,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub start_time: f64,
	#[serde(default)]
	pub end_time: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub words: Option<Vec<Word>>,
}

impl Segment {
	/// Copy without the per-word timings, for listing responses.
	pub fn without_words(&self) -> Segment {
		Segment { words: None, ..self.clone() }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
	Success,
	Error,
}

/// Result of a meeting summary generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
	pub raw_text: String,
	pub generated_at: String,
	#[serde(rename = "model")]
	pub model_key: String,
	pub status: SummaryStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// The unit of work and of retrieval. Field names match the persisted
/// history format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
	pub id: String,
	pub original_name: String,
	#[serde(rename = "filename")]
	pub stored_name: String,
	#[serde(rename = "filepath")]
	pub stored_path: PathBuf,
	#[serde(rename = "size", default)]
	pub size_bytes: u64,
	pub upload_time: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub complete_time: Option<String>,
	#[serde(rename = "status")]
	pub state: FileState,
	#[serde(default)]
	pub progress: u8,
	#[serde(default)]
	pub language: Language,
	#[serde(default)]
	pub error_message: String,
	/// Cooperative stop flag. In-process only, never persisted.
	#[serde(skip)]
	pub cancelled: bool,
	#[serde(rename = "transcript_data", default, skip_serializing_if = "Option::is_none")]
	pub segments: Option<Vec<Segment>>,
	#[serde(rename = "transcript_file", default, skip_serializing_if = "Option::is_none")]
	pub transcript_doc: Option<PathBuf>,
	#[serde(rename = "summary_file", default, skip_serializing_if = "Option::is_none")]
	pub summary_doc: Option<PathBuf>,
	#[serde(rename = "meeting_summary", default, skip_serializing_if = "Option::is_none")]
	pub summary: Option<Summary>,
}

impl FileRecord {
	pub fn new(id: String, original_name: String, stored_name: String, stored_path: PathBuf, size_bytes: u64) -> Self {
		Self {
			id,
			original_name,
			stored_name,
			stored_path,
			size_bytes,
			upload_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
			complete_time: None,
			state: FileState::Uploaded,
			progress: 0,
			language: Language::default(),
			error_message: String::new(),
			cancelled: false,
			segments: None,
			transcript_doc: None,
			summary_doc: None,
			summary: None,
		}
	}

	/// Short id used as a filename suffix for artifacts.
	pub fn short_id(&self) -> String {
		short_id(&self.id)
	}
}

pub fn short_id(id: &str) -> String {
	id.chars().filter(|c| *c != '-').take(8).collect()
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
	#[error("文件不存在")]
	NotFound(String),

	#[error("duplicate file id {0}")]
	DuplicateId(String),

	#[error("文件正在处理中")]
	Busy(String),

	#[error("progress may not regress from {from} to {to}")]
	ProgressRegression { from: u8, to: u8 },

	#[error("invalid state transition {from} -> {to}")]
	InvalidTransition { from: FileState, to: FileState },
}

/// Unfiltered per-state counts, returned alongside every listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
	pub uploaded: usize,
	pub processing: usize,
	pub completed: usize,
	pub error: usize,
}

#[derive(Default)]
struct Catalogue {
	files: HashMap<String, FileRecord>,
	processing: HashSet<String>,
	completed: HashSet<String>,
}

impl Catalogue {
	fn reindex(&mut self, id: &str, state: FileState) {
		match state {
			FileState::Processing => {
				self.processing.insert(id.to_string());
				self.completed.remove(id);
			}
			FileState::Completed => {
				self.processing.remove(id);
				self.completed.insert(id.to_string());
			}
			FileState::Uploaded | FileState::Error => {
				self.processing.remove(id);
				self.completed.remove(id);
			}
		}
	}

	fn counts(&self) -> StatusCounts {
		let mut counts = StatusCounts::default();
		for record in self.files.values() {
			match record.state {
				FileState::Uploaded => counts.uploaded += 1,
				FileState::Processing => counts.processing += 1,
				FileState::Completed => counts.completed += 1,
				FileState::Error => counts.error += 1,
			}
		}
		counts
	}
}

/// The single source of truth for in-memory file records.
///
/// All operations take the lock, mutate or copy, and release before
/// returning; callers only ever see snapshot clones. Mutations run through
/// [`FileRegistry::update`] which validates the lifecycle rules before
/// committing, so a rejected mutation leaves the stored record untouched.
#[derive(Default)]
pub struct FileRegistry {
	inner: Mutex<Catalogue>,
}

impl FileRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, record: FileRecord) -> Result<String, RegistryError> {
		let mut inner = self.lock();
		if inner.files.contains_key(&record.id) {
			return Err(RegistryError::DuplicateId(record.id));
		}
		let id = record.id.clone();
		let state = record.state;
		inner.files.insert(id.clone(), record);
		inner.reindex(&id, state);
		Ok(id)
	}

	pub fn get(&self, id: &str) -> Result<FileRecord, RegistryError> {
		let inner = self.lock();
		inner.files.get(id).cloned().ok_or_else(|| RegistryError::NotFound(id.to_string()))
	}

	pub fn contains(&self, id: &str) -> bool {
		self.lock().files.contains_key(id)
	}

	pub fn is_processing(&self, id: &str) -> bool {
		self.lock().processing.contains(id)
	}

	/// Snapshot of every record, sorted for display: processing first,
	/// then by upload time, newest first.
	pub fn all(&self) -> Vec<FileRecord> {
		let inner = self.lock();
		let mut records: Vec<FileRecord> = inner.files.values().cloned().collect();
		sort_for_display(&mut records);
		records
	}

	/// Filtered page plus the unfiltered state counts and the filtered total.
	pub fn list(&self, state: Option<FileState>, limit: Option<usize>, offset: usize) -> (Vec<FileRecord>, StatusCounts, usize) {
		let inner = self.lock();
		let counts = inner.counts();
		let mut records: Vec<FileRecord> = inner
			.files
			.values()
			.filter(|r| state.map_or(true, |s| r.state == s))
			.cloned()
			.collect();
		sort_for_display(&mut records);
		let total = records.len();
		let page: Vec<FileRecord> = match limit {
			Some(limit) => records.into_iter().skip(offset).take(limit).collect(),
			None => records.into_iter().skip(offset).collect(),
		};
		(page, counts, total)
	}

	/// Apply a mutation under the lock. The closure edits a copy; the copy
	/// replaces the stored record only if the resulting transition is legal.
	pub fn update<F>(&self, id: &str, mutate: F) -> Result<FileRecord, RegistryError>
	where
		F: FnOnce(&mut FileRecord),
	{
		let mut inner = self.lock();
		let current = inner.files.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
		let mut next = current.clone();
		mutate(&mut next);
		next.id = current.id.clone();
		validate_transition(current, &next)?;
		let state = next.state;
		inner.files.insert(id.to_string(), next.clone());
		inner.reindex(id, state);
		Ok(next)
	}

	/// Remove a record. Refused while a non-cancelled job is running on it.
	pub fn remove(&self, id: &str) -> Result<FileRecord, RegistryError> {
		let mut inner = self.lock();
		let record = inner.files.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
		if record.state == FileState::Processing && !record.cancelled {
			return Err(RegistryError::Busy(id.to_string()));
		}
		let record = inner.files.remove(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
		inner.processing.remove(id);
		inner.completed.remove(id);
		Ok(record)
	}

	/// Remove every record not currently processing; returns the removed set.
	pub fn drain_non_processing(&self) -> Vec<FileRecord> {
		let mut inner = self.lock();
		let ids: Vec<String> = inner
			.files
			.values()
			.filter(|r| r.state != FileState::Processing)
			.map(|r| r.id.clone())
			.collect();
		let mut removed = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(record) = inner.files.remove(&id) {
				inner.processing.remove(&id);
				inner.completed.remove(&id);
				removed.push(record);
			}
		}
		removed
	}

	/// Fold records loaded from the history store into the catalogue.
	/// Live `uploaded`/`processing` records always win over their history
	/// counterpart.
	pub fn merge_history(&self, records: Vec<FileRecord>) {
		let mut inner = self.lock();
		for record in records {
			if let Some(existing) = inner.files.get(&record.id) {
				if matches!(existing.state, FileState::Uploaded | FileState::Processing) {
					continue;
				}
			}
			let id = record.id.clone();
			let state = record.state;
			inner.files.insert(id.clone(), record);
			inner.reindex(&id, state);
		}
	}

	/// Snapshot of the completed subset, for persisting.
	pub fn completed_records(&self) -> Vec<FileRecord> {
		let inner = self.lock();
		let mut records: Vec<FileRecord> = inner.files.values().filter(|r| r.state == FileState::Completed).cloned().collect();
		records.sort_by(|a, b| a.upload_time.cmp(&b.upload_time));
		records
	}

	pub fn counts(&self) -> StatusCounts {
		self.lock().counts()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Catalogue> {
		match self.inner.lock() {
			Ok(guard) => guard,
			Err(poisoned) => {
				warn!("file registry lock poisoned, continuing with inner state");
				poisoned.into_inner()
			}
		}
	}
}

fn sort_for_display(records: &mut [FileRecord]) {
	records.sort_by(|a, b| {
		a.state
			.priority()
			.cmp(&b.state.priority())
			.then_with(|| b.upload_time.cmp(&a.upload_time))
	});
}

fn validate_transition(current: &FileRecord, next: &FileRecord) -> Result<(), RegistryError> {
	let legal = current.state == next.state
		|| matches!(
			(current.state, next.state),
			(FileState::Uploaded, FileState::Processing)
				| (FileState::Processing, _)
				| (FileState::Completed, FileState::Processing)
				| (FileState::Error, FileState::Processing)
		);
	if !legal {
		return Err(RegistryError::InvalidTransition {
			from: current.state,
			to: next.state,
		});
	}

	// Progress only moves forward, except when the job errors out or a
	// cancellation hands the record back to `uploaded`.
	if next.progress < current.progress {
		let sanctioned_reset = next.state == FileState::Error
			|| (current.state == FileState::Processing && next.state == FileState::Uploaded);
		if !sanctioned_reset {
			return Err(RegistryError::ProgressRegression {
				from: current.progress,
				to: next.progress,
			});
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	fn record(id: &str) -> FileRecord {
		FileRecord::new(
			id.to_string(),
			format!("{id}.mp3"),
			format!("{id}_20250101_000000_000000_abcd1234.mp3"),
			PathBuf::from(format!("/tmp/{id}.mp3")),
			1024,
		)
	}

	#[test]
	fn add_rejects_duplicate_ids() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		assert_eq!(registry.add(record("a")), Err(RegistryError::DuplicateId("a".into())));
	}

	#[test]
	fn get_returns_a_snapshot() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		let mut snapshot = registry.get("a").unwrap();
		snapshot.progress = 99;
		assert_eq!(registry.get("a").unwrap().progress, 0);
	}

	#[test]
	fn update_enforces_monotone_progress() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		registry
			.update("a", |r| {
				r.state = FileState::Processing;
				r.progress = 40;
			})
			.unwrap();

		let err = registry.update("a", |r| r.progress = 30).unwrap_err();
		assert_eq!(err, RegistryError::ProgressRegression { from: 40, to: 30 });
		assert_eq!(registry.get("a").unwrap().progress, 40);
	}

	#[test]
	fn cancellation_reset_is_allowed() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		registry
			.update("a", |r| {
				r.state = FileState::Processing;
				r.progress = 60;
			})
			.unwrap();
		let updated = registry
			.update("a", |r| {
				r.state = FileState::Uploaded;
				r.progress = 0;
			})
			.unwrap();
		assert_eq!(updated.progress, 0);
		assert_eq!(updated.state, FileState::Uploaded);
	}

	#[test]
	fn terminal_states_only_reenter_via_processing() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		registry.update("a", |r| r.state = FileState::Processing).unwrap();
		registry
			.update("a", |r| {
				r.state = FileState::Completed;
				r.progress = 100;
			})
			.unwrap();

		let err = registry.update("a", |r| r.state = FileState::Uploaded).unwrap_err();
		assert!(matches!(err, RegistryError::InvalidTransition { .. }));

		// Retranscribe path stays legal.
		registry.update("a", |r| r.state = FileState::Processing).unwrap();
	}

	#[test]
	fn concurrent_updates_keep_the_maximum_progress() {
		let registry = Arc::new(FileRegistry::new());
		registry.add(record("a")).unwrap();
		registry.update("a", |r| r.state = FileState::Processing).unwrap();

		let attempts = [10u8, 50, 30, 70, 20, 65, 5, 70];
		let handles: Vec<_> = attempts
			.into_iter()
			.map(|p| {
				let registry = Arc::clone(&registry);
				std::thread::spawn(move || {
					// Losing attempts are rejected as regressions; that is the point.
					let _ = registry.update("a", |r| r.progress = p);
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(registry.get("a").unwrap().progress, 70);
	}

	#[test]
	fn remove_refuses_active_processing() {
		let registry = FileRegistry::new();
		registry.add(record("a")).unwrap();
		registry.update("a", |r| r.state = FileState::Processing).unwrap();

		assert_eq!(registry.remove("a"), Err(RegistryError::Busy("a".into())));

		registry.update("a", |r| r.cancelled = true).unwrap();
		assert!(registry.remove("a").is_ok());
		assert!(!registry.contains("a"));
	}

	#[test]
	fn merge_history_never_overwrites_live_records() {
		let registry = FileRegistry::new();
		registry.add(record("live")).unwrap();
		registry.update("live", |r| r.state = FileState::Processing).unwrap();

		let mut from_disk = record("live");
		from_disk.state = FileState::Completed;
		from_disk.progress = 100;
		let mut done = record("done");
		done.state = FileState::Completed;
		done.progress = 100;

		registry.merge_history(vec![from_disk, done]);

		assert_eq!(registry.get("live").unwrap().state, FileState::Processing);
		assert_eq!(registry.get("done").unwrap().state, FileState::Completed);
		assert_eq!(registry.counts().completed, 1);
	}

	#[test]
	fn list_sorts_by_state_priority_then_recency() {
		let registry = FileRegistry::new();
		for (id, time) in [("one", "2025-01-01 10:00:00"), ("two", "2025-01-01 11:00:00"), ("three", "2025-01-01 12:00:00")] {
			let mut r = record(id);
			r.upload_time = time.to_string();
			registry.add(r).unwrap();
		}
		registry.update("one", |r| r.state = FileState::Processing).unwrap();

		let (page, counts, total) = registry.list(None, None, 0);
		assert_eq!(total, 3);
		assert_eq!(counts.processing, 1);
		assert_eq!(counts.uploaded, 2);
		let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
		assert_eq!(ids, ["one", "three", "two"]);
	}

	#[test]
	fn list_pagination_and_filter() {
		let registry = FileRegistry::new();
		for i in 0..5 {
			let mut r = record(&format!("f{i}"));
			r.upload_time = format!("2025-01-01 10:00:0{i}");
			registry.add(r).unwrap();
		}
		let (page, _, total) = registry.list(Some(FileState::Uploaded), Some(2), 1);
		assert_eq!(total, 5);
		assert_eq!(page.len(), 2);
		assert_eq!(page[0].id, "f3");
		assert_eq!(page[1].id, "f2");
	}
}
