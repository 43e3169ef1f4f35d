//! Error types for sync operations
//!
//! `SyncError` is the taxonomy surfaced to callers: integrity failures are
//! retryable per blob, conflicts are per path, I/O and protocol errors abort
//! the transaction they occur in. Every variant can name the paths and hashes
//! it concerns so failure responses are never anonymous.

use std::error::Error;
use std::fmt;
use std::io;
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::transaction::TransactionState;
use crate::types::ContentHash;

/// Main error type for sync operations
#[derive(Debug)]
pub enum SyncError {
	/// Received bytes do not hash to the claimed value
	Integrity { hash: ContentHash, actual: ContentHash },

	/// Server state diverged from the client's baseline on these paths
	Conflict { conflicts: Vec<Conflict> },

	/// Local disk failure
	Io { path: String, source: io::Error },

	/// Malformed or out-of-sequence request
	Protocol { message: String, paths: Vec<String> },

	/// Repository is not configured
	UnknownRepository { name: String },

	/// Transaction id is not (or no longer) known
	UnknownTransaction { id: Uuid },

	/// Operation not allowed in the transaction's current state
	InvalidState { id: Uuid, state: TransactionState, operation: &'static str },

	/// Blobs required by a commit are not in the content store
	MissingBlobs { hashes: Vec<ContentHash> },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Content store error (nested)
	Store(StoreError),

	/// State database error (nested)
	State(StateError),
}

impl SyncError {
	pub fn protocol(message: impl Into<String>) -> Self {
		SyncError::Protocol { message: message.into(), paths: vec![] }
	}

	pub fn protocol_at(message: impl Into<String>, path: impl Into<String>) -> Self {
		SyncError::Protocol { message: message.into(), paths: vec![path.into()] }
	}

	pub fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
		SyncError::Io { path: path.as_ref().display().to_string(), source }
	}

	/// Stable machine-readable category
	pub fn kind(&self) -> &'static str {
		match self {
			SyncError::Integrity { .. } => "integrity",
			SyncError::Conflict { .. } => "conflict",
			SyncError::Io { .. } => "io",
			SyncError::Protocol { .. } => "protocol",
			SyncError::UnknownRepository { .. } => "unknown-repository",
			SyncError::UnknownTransaction { .. } => "unknown-transaction",
			SyncError::InvalidState { .. } => "invalid-state",
			SyncError::MissingBlobs { .. } => "missing-blobs",
			SyncError::InvalidConfig { .. } => "invalid-config",
			SyncError::Store(StoreError::Integrity { .. }) => "integrity",
			SyncError::Store(StoreError::NotFound { .. }) => "missing-blobs",
			SyncError::Store(_) => "io",
			SyncError::State(_) => "io",
		}
	}

	/// Paths involved in this error
	pub fn paths(&self) -> Vec<String> {
		match self {
			SyncError::Conflict { conflicts } => conflicts.iter().map(|c| c.path.clone()).collect(),
			SyncError::Io { path, .. } => vec![path.clone()],
			SyncError::Protocol { paths, .. } => paths.clone(),
			SyncError::Store(StoreError::Io { path, .. }) => vec![path.clone()],
			_ => vec![],
		}
	}

	/// Hashes involved in this error
	pub fn hashes(&self) -> Vec<ContentHash> {
		match self {
			SyncError::Integrity { hash, actual } => vec![*hash, *actual],
			SyncError::Conflict { conflicts } => conflicts
				.iter()
				.flat_map(|c| [c.baseline, c.server, c.client])
				.flatten()
				.collect(),
			SyncError::MissingBlobs { hashes } => hashes.clone(),
			SyncError::Store(StoreError::NotFound { hash }) => vec![*hash],
			SyncError::Store(StoreError::Integrity { expected, actual }) => vec![*expected, *actual],
			SyncError::Store(StoreError::TooLarge { hash, .. }) => vec![*hash],
			_ => vec![],
		}
	}

	/// Errors that end the transaction they occur in
	pub fn aborts_transaction(&self) -> bool {
		matches!(
			self,
			SyncError::Io { .. }
				| SyncError::Protocol { .. }
				| SyncError::Store(StoreError::Io { .. })
				| SyncError::State(_)
		)
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Integrity { hash, actual } => {
				write!(f, "Integrity error: blob {} hashed to {}", hash, actual)
			}
			SyncError::Conflict { conflicts } => {
				let paths: Vec<&str> = conflicts.iter().map(|c| c.path.as_str()).collect();
				write!(f, "Conflict on {} path(s): {}", paths.len(), paths.join(", "))
			}
			SyncError::Io { path, source } => write!(f, "I/O error on {}: {}", path, source),
			SyncError::Protocol { message, paths } if paths.is_empty() => {
				write!(f, "Protocol error: {}", message)
			}
			SyncError::Protocol { message, paths } => {
				write!(f, "Protocol error: {} ({})", message, paths.join(", "))
			}
			SyncError::UnknownRepository { name } => write!(f, "Unknown repository: {}", name),
			SyncError::UnknownTransaction { id } => write!(f, "Unknown transaction: {}", id),
			SyncError::InvalidState { id, state, operation } => {
				write!(f, "Transaction {} is {}, cannot {}", id, state, operation)
			}
			SyncError::MissingBlobs { hashes } => {
				let list: Vec<String> = hashes.iter().map(|h| h.to_hex()).collect();
				write!(f, "Missing blobs: {}", list.join(", "))
			}
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Store(e) => write!(f, "Content store error: {}", e),
			SyncError::State(e) => write!(f, "State error: {}", e),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io { source, .. } => Some(source),
			SyncError::Store(e) => Some(e),
			SyncError::State(e) => Some(e),
			_ => None,
		}
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::Integrity { expected, actual } => {
				SyncError::Integrity { hash: expected, actual }
			}
			StoreError::NotFound { hash } => SyncError::MissingBlobs { hashes: vec![hash] },
			other => SyncError::Store(other),
		}
	}
}

impl From<StateError> for SyncError {
	fn from(e: StateError) -> Self {
		SyncError::State(e)
	}
}

/// Content store errors
#[derive(Debug)]
pub enum StoreError {
	/// No blob stored under this hash
	NotFound { hash: ContentHash },

	/// Stored or received bytes do not match their hash
	Integrity { expected: ContentHash, actual: ContentHash },

	/// Blob exceeds the configured size limit
	TooLarge { hash: ContentHash, size: u64, max: u64 },

	/// Disk failure
	Io { path: String, source: io::Error },
}

impl StoreError {
	pub fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
		StoreError::Io { path: path.as_ref().display().to_string(), source }
	}
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::NotFound { hash } => write!(f, "Blob not found: {}", hash),
			StoreError::Integrity { expected, actual } => {
				write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
			}
			StoreError::TooLarge { hash, size, max } => {
				write!(f, "Blob {} of {} bytes exceeds maximum {}", hash, size, max)
			}
			StoreError::Io { path, source } => write!(f, "I/O error on {}: {}", path, source),
		}
	}
}

impl Error for StoreError {}

/// State database errors
#[derive(Debug)]
pub enum StateError {
	/// Database could not be opened, read or written
	Database { message: String },

	/// A stored record failed to decode
	Corrupted { message: String },
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StateError::Database { message } => write!(f, "State database error: {}", message),
			StateError::Corrupted { message } => write!(f, "State corrupted: {}", message),
		}
	}
}

impl Error for StateError {}

macro_rules! state_error_from {
	($($ty:ty),* $(,)?) => {
		$(
			impl From<$ty> for StateError {
				fn from(e: $ty) -> Self {
					StateError::Database { message: e.to_string() }
				}
			}
		)*
	};
}

state_error_from!(
	redb::Error,
	redb::DatabaseError,
	redb::TransactionError,
	redb::TableError,
	redb::StorageError,
	redb::CommitError,
);

impl From<serde_json::Error> for StateError {
	fn from(e: serde_json::Error) -> Self {
		StateError::Corrupted { message: e.to_string() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_store_integrity_maps_to_integrity() {
		let expected = ContentHash::of(b"a");
		let actual = ContentHash::of(b"b");
		let err: SyncError = StoreError::Integrity { expected, actual }.into();
		assert_eq!(err.kind(), "integrity");
		assert_eq!(err.hashes(), vec![expected, actual]);
		assert!(!err.aborts_transaction());
	}

	#[test]
	fn test_not_found_names_hash() {
		let hash = ContentHash::of(b"gone");
		let err: SyncError = StoreError::NotFound { hash }.into();
		assert_eq!(err.kind(), "missing-blobs");
		assert!(err.to_string().contains(&hash.to_hex()));
	}

	#[test]
	fn test_io_names_path() {
		let err = SyncError::io("/srv/a.txt", io::Error::new(io::ErrorKind::Other, "disk"));
		assert_eq!(err.paths(), vec!["/srv/a.txt".to_string()]);
		assert!(err.aborts_transaction());
	}

	#[test]
	fn test_protocol_display_lists_paths() {
		let err = SyncError::protocol_at("bad path", "../x");
		assert!(err.to_string().contains("../x"));
		assert_eq!(err.kind(), "protocol");
	}
}

// vim: ts=4
