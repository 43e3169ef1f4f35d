//! `.syncignore` parsing and matching
//!
//! Uses the `ignore` crate (same as ripgrep) for gitignore-style pattern handling.

use super::ExclusionError;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Compiled ignore file from the repository root
pub struct IgnoreFileMatcher {
	gitignore: Gitignore,
}

impl IgnoreFileMatcher {
	/// Load `<root>/<file_name>`; `None` if the file does not exist
	pub fn load(root: &Path, file_name: &str) -> Result<Option<Self>, ExclusionError> {
		let ignore_file = root.join(file_name);
		if !ignore_file.is_file() {
			return Ok(None);
		}

		let mut builder = GitignoreBuilder::new(root);
		// add() returns Option<Error>, None on success
		if let Some(err) = builder.add(&ignore_file) {
			return Err(ExclusionError::IgnoreFileError(format!(
				"Failed to add {}: {}",
				ignore_file.display(),
				err
			)));
		}
		let gitignore =
			builder.build().map_err(|e| ExclusionError::IgnoreFileError(e.to_string()))?;

		Ok(Some(Self { gitignore }))
	}

	/// Check a root-relative path, including its parent directories
	pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
		self.gitignore.matched_path_or_any_parents(path, is_dir).is_ignore()
	}
}


// vim: ts=4
