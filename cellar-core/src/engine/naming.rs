use chrono::{DateTime, NaiveDateTime, Utc};

use crate::models::{Artifact, Target};

/// UTC, second resolution. Sorts lexicographically in time order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const TIMESTAMP_LEN: usize = 15;

/// Extensions a prebuilt backup archive may carry.
pub const ARCHIVE_EXTENSIONS: [&str; 3] = [".tar.gz", ".zip", ".7z"];

/// `{prefix}_{suffix}_{timestamp}.{ext}`; the suffix part is dropped when unset.
pub fn derive_remote_name(
	name_prefix: &str,
	format_suffix: Option<&str>,
	now: DateTime<Utc>,
	extension: &str,
) -> String {
	let ts = now.format(TIMESTAMP_FORMAT);
	let ext = extension.trim_start_matches('.');
	match format_suffix.filter(|s| !s.is_empty()) {
		Some(suffix) => format!("{name_prefix}_{suffix}_{ts}.{ext}"),
		None => format!("{name_prefix}_{ts}.{ext}"),
	}
}

/// The prefix retention should scope itself to for this target.
///
/// Configured override first, then whatever name the producer's output
/// already carried, then the identity's last segment.
pub fn resolve_prefix(target: &Target, artifact: Option<&Artifact>) -> String {
	if let Some(prefix) = target.expected_name_prefix.as_deref().filter(|p| !p.is_empty()) {
		return prefix.to_string();
	}
	if let Some(prefix) = artifact.and_then(|a| a.detected_prefix.as_deref()).filter(|p| !p.is_empty()) {
		return prefix.to_string();
	}
	target.short_name().to_string()
}

fn timestamp_shaped(window: &[u8]) -> bool {
	window.len() == TIMESTAMP_LEN
		&& window[..8].iter().all(u8::is_ascii_digit)
		&& window[8] == b'_'
		&& window[9..].iter().all(u8::is_ascii_digit)
}

/// Last `YYYYMMDD_HHMMSS` token in `name`, with its byte offset.
fn find_timestamp(name: &str) -> Option<(usize, NaiveDateTime)> {
	let bytes = name.as_bytes();
	if bytes.len() < TIMESTAMP_LEN {
		return None;
	}

	for start in (0..=bytes.len() - TIMESTAMP_LEN).rev() {
		if !timestamp_shaped(&bytes[start..start + TIMESTAMP_LEN]) {
			continue;
		}

		// don't match inside a longer run of digits
		let before_ok = start == 0 || !bytes[start - 1].is_ascii_digit();
		let after_ok = start + TIMESTAMP_LEN == bytes.len() || !bytes[start + TIMESTAMP_LEN].is_ascii_digit();
		if !(before_ok && after_ok) {
			continue;
		}

		// all-ASCII window, so these are char boundaries
		if let Some(parsed) = name
			.get(start..start + TIMESTAMP_LEN)
			.and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
		{
			return Some((start, parsed));
		}
	}

	None
}

/// What a target's artifacts are named up to the timestamp: the prefix,
/// plus the format suffix when one is configured.
pub fn name_stem(prefix: &str, format_suffix: Option<&str>) -> String {
	match format_suffix.filter(|s| !s.is_empty()) {
		Some(suffix) => format!("{prefix}_{suffix}"),
		None => prefix.to_string(),
	}
}

/// Timestamp of `name` when it is exactly `{stem}_{YYYYMMDD_HHMMSS}.{ext}`.
///
/// The timestamp must follow the stem directly, so `shop_eu_20240101_030000.db`
/// is not an artifact of `shop`.
pub fn artifact_timestamp(name: &str, stem: &str) -> Option<NaiveDateTime> {
	if stem.is_empty() {
		return None;
	}
	let rest = name.strip_prefix(stem)?.strip_prefix('_')?;
	let stamp = rest.get(..TIMESTAMP_LEN)?;
	let ext = rest.get(TIMESTAMP_LEN..)?;
	if ext.len() < 2 || !ext.starts_with('.') {
		return None;
	}
	if !timestamp_shaped(stamp.as_bytes()) {
		return None;
	}
	NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Entries to delete so that only the newest `retention_count` artifacts
/// named `{stem}_{timestamp}.{ext}` survive. Oldest first.
///
/// Anything else in the directory is never returned. With fewer matches than
/// the retention count nothing is stale.
pub fn select_stale<S: AsRef<str>>(entries: &[S], stem: &str, retention_count: usize) -> Vec<String> {
	let keep = retention_count.max(1);

	let mut matching: Vec<(NaiveDateTime, &str)> = entries
		.iter()
		.map(AsRef::as_ref)
		.filter_map(|name| artifact_timestamp(name, stem).map(|ts| (ts, name)))
		.collect();

	// newest first, ties by full name
	matching.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(a.1)));
	matching.dedup_by(|a, b| a.1 == b.1);

	if matching.len() <= keep {
		return Vec::new();
	}

	let mut stale: Vec<String> = matching
		.into_iter()
		.skip(keep)
		.map(|(_, name)| name.to_string())
		.collect();
	stale.reverse();
	stale
}

/// Whether any entry in `entries` is an artifact named after `stem`.
pub fn has_prior_artifacts<S: AsRef<str>>(entries: &[S], stem: &str) -> bool {
	entries
		.iter()
		.any(|name| artifact_timestamp(name.as_ref(), stem).is_some())
}

/// Strip a known archive extension, if any.
pub fn strip_archive_extension(file_name: &str) -> &str {
	ARCHIVE_EXTENSIONS
		.iter()
		.find_map(|ext| file_name.strip_suffix(ext))
		.unwrap_or(file_name)
}

/// Extension of a prebuilt archive name, without the leading dot.
pub fn archive_extension(file_name: &str) -> Option<&'static str> {
	ARCHIVE_EXTENSIONS
		.iter()
		.find(|ext| file_name.ends_with(*ext))
		.map(|ext| ext.trim_start_matches('.'))
}

/// Recover the naming prefix from an already-named archive.
///
/// `sillytavern_backup_20240101_030000.tar.gz` → `sillytavern`,
/// `notes_20240101_030000.zip` → `notes`.
pub fn detect_prefix(file_name: &str) -> Option<String> {
	let base = file_name.rsplit('/').next().unwrap_or(file_name);
	let stem = strip_archive_extension(base);

	if let Some(idx) = stem.find("_backup_").or_else(|| stem.strip_suffix("_backup").map(str::len)) {
		if idx > 0 {
			return Some(stem[..idx].to_string());
		}
	}

	if let Some((idx, _)) = find_timestamp(stem) {
		let prefix = stem[..idx].trim_end_matches('_');
		if !prefix.is_empty() {
			return Some(prefix.to_string());
		}
		return None;
	}

	// no timestamp: assume the last segment is a version/date of some kind
	stem.rsplit_once('_')
		.map(|(head, _)| head)
		.filter(|head| !head.is_empty())
		.map(str::to_string)
}
