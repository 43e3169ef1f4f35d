//! Pattern-based file exclusion using glob patterns

use super::ExclusionError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Pattern matcher using globset for efficient matching
pub struct PatternMatcher {
	/// Compiled exclusion patterns
	exclude_set: GlobSet,

	/// Compiled inclusion patterns (override `exclude_set`)
	include_set: Option<GlobSet>,

	/// Directory prefixes of `dir/**` exclusions
	dir_set: GlobSet,

	/// The reserved data directory; no pattern can re-include it
	always_exclude: GlobSet,
}

impl PatternMatcher {
	/// Create a new pattern matcher
	pub fn new(
		reserved: &str,
		exclude_patterns: &[String],
		include_patterns: &[String],
	) -> Result<Self, ExclusionError> {
		let always_exclude = Self::build_glob_set(&[
			globset::escape(reserved),
			format!("{}/**", globset::escape(reserved)),
		])?;
		let exclude_set = Self::build_glob_set(exclude_patterns)?;
		let dir_patterns: Vec<String> = exclude_patterns
			.iter()
			.filter_map(|p| p.strip_suffix("/**"))
			.filter(|p| !p.is_empty())
			.map(String::from)
			.collect();
		let dir_set = Self::build_glob_set(&dir_patterns)?;
		let include_set = if !include_patterns.is_empty() {
			Some(Self::build_glob_set(include_patterns)?)
		} else {
			None
		};

		Ok(Self { exclude_set, include_set, dir_set, always_exclude })
	}

	/// Build a GlobSet from patterns
	fn build_glob_set(patterns: &[String]) -> Result<GlobSet, ExclusionError> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = Glob::new(pattern)
				.map_err(|e| ExclusionError::InvalidPattern(format!("{}: {}", pattern, e)))?;
			builder.add(glob);
		}
		builder.build().map_err(|e| {
			ExclusionError::InvalidPattern(format!("Failed to build pattern set: {}", e))
		})
	}

	/// Check if a file path is excluded by the reserved or user patterns
	pub fn is_excluded(&self, path: &Path) -> bool {
		if self.always_exclude.is_match(path) {
			return true;
		}
		if self.is_included(path) {
			return false;
		}
		self.exclude_set.is_match(path)
	}

	/// Like [`is_excluded`](Self::is_excluded), but a directory pattern
	/// such as `build/**` also matches the `build` directory itself
	pub fn is_excluded_dir(&self, path: &Path) -> bool {
		if self.is_excluded(path) {
			return true;
		}
		!self.is_included(path) && self.dir_set.is_match(path)
	}

	/// Check if a path matches an include pattern
	pub fn is_included(&self, path: &Path) -> bool {
		self.include_set.as_ref().is_some_and(|set| set.is_match(path))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn strings(patterns: &[&str]) -> Vec<String> {
		patterns.iter().map(|p| p.to_string()).collect()
	}

	#[test]
	fn test_basic_exclusion() {
		let matcher = PatternMatcher::new(".reposync", &strings(&["*.log", "*.tmp"]), &[]).unwrap();

		assert!(matcher.is_excluded(Path::new("test.log")));
		assert!(matcher.is_excluded(Path::new("foo/bar.tmp")));
		assert!(!matcher.is_excluded(Path::new("test.txt")));
	}

	#[test]
	fn test_reserved_directory() {
		let matcher = PatternMatcher::new(".reposync", &[], &strings(&["**"])).unwrap();

		assert!(matcher.is_excluded(Path::new(".reposync")));
		assert!(matcher.is_excluded(Path::new(".reposync/objects/ab/cd")));
		assert!(!matcher.is_excluded(Path::new("sub/.reposync")));
	}

	#[test]
	fn test_directory_patterns() {
		let matcher =
			PatternMatcher::new(".reposync", &strings(&["node_modules/**", "*.log"]), &[]).unwrap();

		assert!(matcher.is_excluded(Path::new("node_modules/package/file.js")));
		assert!(matcher.is_excluded_dir(Path::new("node_modules")));
		assert!(!matcher.is_excluded_dir(Path::new("logs")));
		assert!(!matcher.is_excluded(Path::new("src/main.rs")));
	}

	#[test]
	fn test_invalid_pattern() {
		assert!(PatternMatcher::new(".reposync", &strings(&["a[b"]), &[]).is_err());
	}
}

// vim: ts=4
