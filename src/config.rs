//! Server configuration
//!
//! The launcher parses its configuration file into a [`ServerConfig`] and hands
//! it to [`crate::engine::SyncEngine::open`]. Every field has a default, so a
//! minimal file only needs repository paths:
//!
//! ```json
//! { "repositories": { "main": { "path": "/srv/main" } } }
//! ```
//!
//! `ServerConfig::load` accepts `.json`, `.json5` and `.toml` files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::validation::{self, ValidationError, Validator};

/// Name of the per-repository data directory (store, staging, journal, state db)
pub const DEFAULT_DATA_DIR_NAME: &str = ".reposync";

/// Default idle time after which an unfinished transaction is aborted
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 3600;

/// Top-level configuration: the set of repositories this process serves
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
	pub repositories: BTreeMap<String, RepositoryConfig>,
}

/// Configuration of a single repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
	/// Root of the live tree
	pub path: PathBuf,

	/// Name of the data directory created directly below `path`.
	/// It is excluded from manifests and may not be written by clients.
	/// Living inside the root keeps staging on the same filesystem as the
	/// live tree, which the atomic rename in the commit step relies on.
	pub data_dir_name: String,

	/// Glob patterns excluded from manifests (e.g. "*.tmp", "build/**")
	pub exclude_patterns: Vec<String>,

	/// Glob patterns that override exclusions
	pub include_patterns: Vec<String>,

	/// Honor a `.syncignore` file at the repository root
	pub respect_ignore_files: bool,

	/// Reuse cached hashes for files whose size, mtime, ctime and inode are unchanged
	pub fast_path: bool,

	/// Abort transactions idle for longer than this
	pub transaction_timeout_secs: u64,

	/// Refuse blobs larger than this (bytes)
	pub max_blob_size: Option<u64>,
}

impl Default for RepositoryConfig {
	fn default() -> Self {
		RepositoryConfig {
			path: PathBuf::new(),
			data_dir_name: DEFAULT_DATA_DIR_NAME.to_string(),
			exclude_patterns: vec![],
			include_patterns: vec![],
			respect_ignore_files: true,
			fast_path: false,
			transaction_timeout_secs: DEFAULT_TRANSACTION_TIMEOUT_SECS,
			max_blob_size: None,
		}
	}
}

impl RepositoryConfig {
	/// Configuration for a tree rooted at `path` with all defaults
	pub fn new(path: impl Into<PathBuf>) -> Self {
		RepositoryConfig { path: path.into(), ..Default::default() }
	}

	/// Absolute location of the data directory
	pub fn data_dir(&self) -> PathBuf {
		self.path.join(&self.data_dir_name)
	}
}

impl Validator for RepositoryConfig {
	fn validate(&self) -> Result<(), ValidationError> {
		if self.path.as_os_str().is_empty() {
			return Err(ValidationError::ConfigError("Repository path must be set".to_string()));
		}
		validation::validate_reserved_name(&self.data_dir_name)?;
		validation::validate_timeout_secs(self.transaction_timeout_secs)?;
		if self.max_blob_size == Some(0) {
			return Err(ValidationError::ConfigError(
				"maxBlobSize must be greater than 0".to_string(),
			));
		}
		Ok(())
	}
}

impl Validator for ServerConfig {
	fn validate(&self) -> Result<(), ValidationError> {
		for (name, repo) in &self.repositories {
			validation::validate_repository_name(name)?;
			repo.validate().map_err(|e| {
				ValidationError::ConfigError(format!("repository {:?}: {}", name, e))
			})?;
		}
		Ok(())
	}
}

impl ServerConfig {
	/// Load and validate a configuration file, format chosen by extension
	pub fn load(path: &Path) -> Result<Self, SyncError> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| SyncError::Io { path: path.display().to_string(), source: e })?;
		let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
		let config = Self::parse(&text, extension)?;
		config.validate().map_err(|e| SyncError::InvalidConfig { message: e.to_string() })?;
		Ok(config)
	}

	/// Parse configuration text in the given format ("json", "json5" or "toml")
	pub fn parse(text: &str, format: &str) -> Result<Self, SyncError> {
		let invalid = |message: String| SyncError::InvalidConfig { message };
		match format {
			"toml" => toml::from_str(text).map_err(|e| invalid(e.to_string())),
			"json5" => json5::from_str(text).map_err(|e| invalid(e.to_string())),
			"json" => serde_json::from_str(text).map_err(|e| invalid(e.to_string())),
			other => Err(invalid(format!("Unsupported config format: {}", other))),
		}
	}

	/// Add a repository (builder style, mostly for embedding and tests)
	pub fn with_repository(mut self, name: impl Into<String>, config: RepositoryConfig) -> Self {
		self.repositories.insert(name.into(), config);
		self
	}
}


// vim: ts=4
