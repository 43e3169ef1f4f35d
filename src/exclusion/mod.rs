//! Exclusion rules for manifest builds
//!
//! Combines glob patterns from the repository configuration, an optional
//! `.syncignore` at the repository root, and the reserved data directory,
//! which is always excluded.

mod ignore;
mod patterns;

pub use ignore::IgnoreFileMatcher;
pub use patterns::PatternMatcher;

use std::path::Path;

use crate::config::RepositoryConfig;

/// Name of the gitignore-style file honored at the repository root
pub const IGNORE_FILE_NAME: &str = ".syncignore";

/// Combined exclusion engine applied while walking a tree
pub struct ExclusionEngine {
	pattern_matcher: PatternMatcher,
	ignore_matcher: Option<IgnoreFileMatcher>,
}

impl ExclusionEngine {
	/// Build the engine for a repository
	pub fn from_config(config: &RepositoryConfig) -> Result<Self, ExclusionError> {
		Self::new(
			&config.path,
			&config.data_dir_name,
			&config.exclude_patterns,
			&config.include_patterns,
			config.respect_ignore_files,
		)
	}

	/// Build an engine from its parts
	///
	/// Include patterns override exclusions, but never the reserved directory.
	pub fn new(
		root: &Path,
		reserved: &str,
		exclude_patterns: &[String],
		include_patterns: &[String],
		respect_ignore_files: bool,
	) -> Result<Self, ExclusionError> {
		let pattern_matcher = PatternMatcher::new(reserved, exclude_patterns, include_patterns)?;
		let ignore_matcher = if respect_ignore_files {
			IgnoreFileMatcher::load(root, IGNORE_FILE_NAME)?
		} else {
			None
		};
		Ok(Self { pattern_matcher, ignore_matcher })
	}

	/// Engine that only excludes the reserved directory
	pub fn reserved_only(reserved: &str) -> Result<Self, ExclusionError> {
		Ok(Self { pattern_matcher: PatternMatcher::new(reserved, &[], &[])?, ignore_matcher: None })
	}

	/// Check if a file (manifest path) should be left out
	pub fn should_exclude(&self, path: &str) -> bool {
		let path = Path::new(path);
		if self.pattern_matcher.is_excluded(path) {
			return true;
		}
		if self.pattern_matcher.is_included(path) {
			return false;
		}
		self.ignore_matcher.as_ref().is_some_and(|m| m.is_ignored(path, false))
	}

	/// Check if a directory should be skipped without descending into it
	pub fn should_exclude_dir(&self, path: &str) -> bool {
		let path = Path::new(path);
		if self.pattern_matcher.is_excluded_dir(path) {
			return true;
		}
		if self.pattern_matcher.is_included(path) {
			return false;
		}
		self.ignore_matcher.as_ref().is_some_and(|m| m.is_ignored(path, true))
	}
}

/// Errors that can occur during exclusion processing
#[derive(Debug)]
pub enum ExclusionError {
	/// Failed to parse a glob pattern
	InvalidPattern(String),

	/// Failed to read or parse an ignore file
	IgnoreFileError(String),
}

impl std::fmt::Display for ExclusionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExclusionError::InvalidPattern(msg) => {
				write!(f, "Invalid exclusion pattern: {}", msg)
			}
			ExclusionError::IgnoreFileError(msg) => {
				write!(f, "Ignore file error: {}", msg)
			}
		}
	}
}

impl std::error::Error for ExclusionError {}

impl From<ExclusionError> for crate::error::SyncError {
	fn from(e: ExclusionError) -> Self {
		crate::error::SyncError::InvalidConfig { message: e.to_string() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_exclusion_engine_basic() {
		let temp_dir = TempDir::new().unwrap();
		let mut config = RepositoryConfig::new(temp_dir.path());
		config.exclude_patterns = vec!["*.log".to_string(), "*.tmp".to_string()];
		let engine = ExclusionEngine::from_config(&config).unwrap();

		assert!(engine.should_exclude("test.log"));
		assert!(engine.should_exclude("deep/a.tmp"));
		assert!(!engine.should_exclude("test.txt"));
	}

	#[test]
	fn test_reserved_always_excluded() {
		let temp_dir = TempDir::new().unwrap();
		let mut config = RepositoryConfig::new(temp_dir.path());
		config.include_patterns = vec!["**".to_string()];
		let engine = ExclusionEngine::from_config(&config).unwrap();

		assert!(engine.should_exclude_dir(".reposync"));
		assert!(engine.should_exclude(".reposync/state.redb"));
		assert!(!engine.should_exclude(".reposyncx"));
	}

	#[test]
	fn test_include_overrides_exclude() {
		let engine = ExclusionEngine::new(
			Path::new("/nonexistent"),
			".reposync",
			&["*.log".to_string()],
			&["keep.log".to_string()],
			false,
		)
		.unwrap();
		assert!(engine.should_exclude("drop.log"));
		assert!(!engine.should_exclude("keep.log"));
	}

	#[test]
	fn test_syncignore_respected() {
		let temp_dir = TempDir::new().unwrap();
		std::fs::write(temp_dir.path().join(IGNORE_FILE_NAME), "build/\n*.bak\n").unwrap();

		let config = RepositoryConfig::new(temp_dir.path());
		let engine = ExclusionEngine::from_config(&config).unwrap();
		assert!(engine.should_exclude_dir("build"));
		assert!(engine.should_exclude("build/out.bin"));
		assert!(engine.should_exclude("notes.bak"));
		assert!(!engine.should_exclude("notes.txt"));

		let mut config = RepositoryConfig::new(temp_dir.path());
		config.respect_ignore_files = false;
		let engine = ExclusionEngine::from_config(&config).unwrap();
		assert!(!engine.should_exclude("notes.bak"));
	}
}

// vim: ts=4
