//! Manifest path validation and normalization
//!
//! Manifest paths are relative, `/`-separated UTF-8 strings with no empty, `.`
//! or `..` segments. Every path received from a peer goes through
//! [`normalize_path`] before it is used to address the live tree.

use std::path::{Path, PathBuf};

use super::ValidationError;

/// Canonical separator used in manifest paths
pub const SEPARATOR: char = '/';

/// Normalize a peer-supplied path into canonical manifest form
///
/// `\` is accepted as a separator, empty and `.` segments are dropped.
/// Absolute paths, `..` segments, NUL bytes and paths that normalize to
/// nothing are rejected.
pub fn normalize_path(raw: &str) -> Result<String, ValidationError> {
	if raw.contains('\0') {
		return Err(ValidationError::PathError(format!("Path {:?} contains a NUL byte", raw)));
	}
	if raw.starts_with('/') || raw.starts_with('\\') || has_drive_prefix(raw) {
		return Err(ValidationError::PathError(format!(
			"Path must be relative, got absolute path: {:?}",
			raw
		)));
	}

	let mut segments = Vec::new();
	for segment in raw.split(|c| c == '/' || c == '\\') {
		match segment {
			"" | "." => continue,
			".." => {
				return Err(ValidationError::PathError(format!(
					"Path {:?} contains parent directory reference (..)",
					raw
				)))
			}
			s => segments.push(s),
		}
	}

	if segments.is_empty() {
		return Err(ValidationError::PathError(format!("Path {:?} is empty", raw)));
	}
	Ok(segments.join("/"))
}

fn has_drive_prefix(raw: &str) -> bool {
	let bytes = raw.as_bytes();
	bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Resolve a normalized manifest path below `root`
pub fn to_fs_path(root: &Path, path: &str) -> PathBuf {
	let mut full = root.to_path_buf();
	for segment in path.split(SEPARATOR) {
		full.push(segment);
	}
	full
}

/// True if the first segment of `path` is the reserved name
pub fn is_reserved(path: &str, reserved: &str) -> bool {
	path.split(SEPARATOR).next() == Some(reserved)
}

/// Proper ancestors of a path, shortest first: `a/b/c` gives `a`, `a/b`
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
	path.match_indices(SEPARATOR).map(move |(idx, _)| &path[..idx])
}

/// True if `descendant` lies below `ancestor`
pub fn is_descendant(descendant: &str, ancestor: &str) -> bool {
	descendant.len() > ancestor.len()
		&& descendant.starts_with(ancestor)
		&& descendant.as_bytes()[ancestor.len()] == b'/'
}


// vim: ts=4
