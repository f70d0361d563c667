use crate::registry::FileRecord;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const HISTORY_FILE_NAME: &str = "history_records.json";

/// On-disk document. `completed_files` is kept for wire compatibility with
/// existing consumers but is always derived from `files` when saving.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
	#[serde(default)]
	files: Vec<FileRecord>,
	#[serde(default)]
	completed_files: Vec<String>,
}

/// Durable record of completed transcriptions, stored as a single JSON
/// document that is replaced atomically on every save.
pub struct HistoryStore {
	path: PathBuf,
}

impl HistoryStore {
	pub fn new(output_dir: &Path) -> Self {
		Self {
			path: output_dir.join(HISTORY_FILE_NAME),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Read the stored records. A missing file is an empty history; a
	/// malformed one is logged and treated as empty rather than crashing.
	pub fn load(&self) -> Vec<FileRecord> {
		let raw = match std::fs::read_to_string(&self.path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
			Err(e) => {
				warn!("failed to read history file {}: {e}", self.path.display());
				return Vec::new();
			}
		};

		match serde_json::from_str::<HistoryDocument>(&raw) {
			Ok(document) => {
				info!("loaded {} history records", document.files.len());
				document.files
			}
			Err(e) => {
				warn!("history file {} is malformed, starting empty: {e}", self.path.display());
				Vec::new()
			}
		}
	}

	/// Persist the completed subset. Writes to a temp file in the same
	/// directory and renames over the target so a crash mid-save can never
	/// leave a torn document behind.
	pub fn save(&self, records: &[FileRecord]) -> std::io::Result<()> {
		let document = HistoryDocument {
			completed_files: records.iter().map(|r| r.id.clone()).collect(),
			files: records.to_vec(),
		};
		let json = serde_json::to_vec_pretty(&document)?;

		let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
		let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
		tmp.write_all(&json)?;
		tmp.as_file().sync_all()?;
		tmp.persist(&self.path).map_err(|e| e.error)?;
		info!("saved {} history records", records.len());
		Ok(())
	}

	/// Truncate the history back to an empty document.
	pub fn clear(&self) -> std::io::Result<()> {
		self.save(&[])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::FileState;

	fn completed(id: &str) -> FileRecord {
		let mut record = FileRecord::new(
			id.to_string(),
			format!("{id}.wav"),
			format!("{id}_stored.wav"),
			PathBuf::from(format!("/tmp/{id}.wav")),
			42,
		);
		record.state = FileState::Completed;
		record.progress = 100;
		record.complete_time = Some("2025-01-02 03:04:05".to_string());
		record
	}

	#[test]
	fn load_missing_file_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::new(dir.path());
		assert!(store.load().is_empty());
	}

	#[test]
	fn load_malformed_file_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(HISTORY_FILE_NAME), b"{not json").unwrap();
		let store = HistoryStore::new(dir.path());
		assert!(store.load().is_empty());
	}

	#[test]
	fn save_then_load_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::new(dir.path());
		let records = vec![completed("a"), completed("b")];

		store.save(&records).unwrap();
		let loaded = store.load();

		assert_eq!(loaded.len(), 2);
		assert_eq!(loaded[0].id, "a");
		assert_eq!(loaded[1].state, FileState::Completed);
		assert_eq!(loaded[1].complete_time.as_deref(), Some("2025-01-02 03:04:05"));
	}

	#[test]
	fn completed_ids_are_derived_from_files() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::new(dir.path());
		store.save(&[completed("x"), completed("y")]).unwrap();

		let raw = std::fs::read_to_string(store.path()).unwrap();
		let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
		assert_eq!(value["completed_files"], serde_json::json!(["x", "y"]));
	}

	#[test]
	fn clear_truncates_to_empty_document() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::new(dir.path());
		store.save(&[completed("a")]).unwrap();
		store.clear().unwrap();

		assert!(store.load().is_empty());
		let raw = std::fs::read_to_string(store.path()).unwrap();
		let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
		assert_eq!(value["files"], serde_json::json!([]));
	}
}
