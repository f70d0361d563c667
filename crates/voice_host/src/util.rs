use chrono::Local;
use serde_json::Value;

pub const ALLOWED_EXTENSIONS: [&str; 7] = ["mp3", "wav", "m4a", "flac", "aac", "ogg", "wma"];

/// Wall-clock display form used across the JSON surface.
pub fn now_display() -> String {
	Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Microsecond-resolution stamp baked into stored and artifact file names.
pub fn artifact_timestamp() -> String {
	Local::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

pub fn allowed_extension(filename: &str) -> bool {
	file_extension(filename).map_or(false, |ext| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

pub fn file_extension(filename: &str) -> Option<&str> {
	let (_, ext) = filename.rsplit_once('.')?;
	if ext.is_empty() {
		None
	} else {
		Some(ext)
	}
}

/// Strip path components and characters that have no business in a stored
/// file name.
pub fn sanitize_filename(name: &str) -> String {
	let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
	let cleaned: String = base
		.chars()
		.map(|c| {
			if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
				c
			} else {
				'_'
			}
		})
		.collect();
	let trimmed = cleaned.trim_matches(['.', '_']).to_string();
	if trimmed.is_empty() {
		"file".to_string()
	} else {
		trimmed
	}
}

/// Server-side basename for an upload: sanitised stem, microsecond stamp,
/// short id, original extension. The stamp alone disambiguates batches; the
/// id suffix disambiguates two uploads landing in the same microsecond.
pub fn stored_file_name(original: &str, timestamp: &str, short_id: &str) -> String {
	let sanitized = sanitize_filename(original);
	let (stem, ext) = match sanitized.rsplit_once('.') {
		Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
		None => (sanitized, String::new()),
	};
	format!("{stem}_{timestamp}_{short_id}{ext}")
}

/// Normalise the `file_ids` field to an ordered, de-duplicated id list.
///
/// Upstream automations hand this to us in several shapes: a JSON array, a
/// JSON-encoded string, a Python-style literal list string, or a bare id.
pub fn parse_file_ids(value: &Value) -> Vec<String> {
	let mut ids = Vec::new();
	collect_file_ids(value, &mut ids);

	let mut seen = std::collections::HashSet::new();
	ids.retain(|id| !id.is_empty() && seen.insert(id.clone()));
	ids
}

fn collect_file_ids(value: &Value, out: &mut Vec<String>) {
	match value {
		Value::Array(items) => {
			for item in items {
				collect_file_ids(item, out);
			}
		}
		Value::String(s) => {
			let trimmed = s.trim();
			if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
				if !matches!(parsed, Value::String(_)) {
					collect_file_ids(&parsed, out);
					return;
				}
			}
			if let Some(items) = parse_literal_list(trimmed) {
				out.extend(items);
				return;
			}
			out.push(trimmed.to_string());
		}
		Value::Number(n) => out.push(n.to_string()),
		_ => {}
	}
}

/// Accept "['a', 'b']"-style strings produced by template engines.
fn parse_literal_list(s: &str) -> Option<Vec<String>> {
	let inner = s.strip_prefix('[')?.strip_suffix(']')?;
	let items = inner
		.split(',')
		.map(|item| item.trim().trim_matches(['\'', '"']).trim().to_string())
		.filter(|item| !item.is_empty())
		.collect();
	Some(items)
}
