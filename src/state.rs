//! Persistent repository state backed by redb
//!
//! Three tables live in `<data>/state.redb`:
//! - `hash_cache`: path -> file stamp + hash, consulted by the manifest
//!   builder's fast path so unchanged files are not re-hashed
//! - `history`: revision -> commit record, appended by every commit
//! - `changes`: revision -> the change set that commit applied

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::diff::ChangeSet;
use crate::error::StateError;
use crate::types::ContentHash;

/// Key: manifest path, value: serialized CacheEntry
const HASH_CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hash_cache");

/// Key: revision, value: serialized HistoryRecord
const HISTORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("history");

/// Key: revision, value: serialized ChangeSet
const CHANGES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("changes");

/// Files modified this recently are not cached (their mtime may still change
/// within the filesystem's timestamp granularity)
const RACY_WINDOW_SECS: i64 = 2;

/// Cheap identity of a file's on-disk state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
	#[serde(rename = "sz")]
	pub size: u64,
	#[serde(rename = "mt")]
	pub mtime: i64,
	#[serde(rename = "mtn")]
	pub mtime_nsec: i64,
	#[serde(rename = "ct")]
	pub ctime: i64,
	#[serde(rename = "ctn")]
	pub ctime_nsec: i64,
	#[serde(rename = "ino")]
	pub inode: u64,
}

impl FileStamp {
	pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
		use std::os::unix::fs::MetadataExt;
		FileStamp {
			size: meta.size(),
			mtime: meta.mtime(),
			mtime_nsec: meta.mtime_nsec(),
			ctime: meta.ctime(),
			ctime_nsec: meta.ctime_nsec(),
			inode: meta.ino(),
		}
	}
}

/// Cache entry for a single file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
	#[serde(rename = "st")]
	stamp: FileStamp,
	#[serde(rename = "h")]
	hash: ContentHash,
}

/// One committed sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
	pub revision: u64,
	pub transaction: Uuid,
	/// Unix seconds
	pub timestamp: u64,
	pub added: usize,
	pub modified: usize,
	pub deleted: usize,
	pub renamed: usize,
	pub metadata_updated: usize,
	/// Every path touched by the commit
	pub paths: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// Repository state database
pub struct StateDb {
	db: redb::Database,
	path: PathBuf,
}

impl std::fmt::Debug for StateDb {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StateDb").field("path", &self.path).finish()
	}
}

impl StateDb {
	/// Open or create the state database
	pub fn open(path: &Path) -> Result<Self, StateError> {
		let db = redb::Database::create(path)?;
		// Ensure every table exists so readers never hit a missing one
		{
			let write_txn = db.begin_write()?;
			let _ = write_txn.open_table(HASH_CACHE_TABLE)?;
			let _ = write_txn.open_table(HISTORY_TABLE)?;
			let _ = write_txn.open_table(CHANGES_TABLE)?;
			write_txn.commit()?;
		}
		Ok(StateDb { db, path: path.to_path_buf() })
	}

	/// Cached hash for `path` if its stamp is unchanged
	pub fn cached_hash(&self, path: &str, stamp: &FileStamp) -> Result<Option<ContentHash>, StateError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(HASH_CACHE_TABLE)?;
		match table.get(path)? {
			Some(guard) => {
				let cached: CacheEntry = serde_json::from_slice(guard.value())?;
				Ok((cached.stamp == *stamp).then_some(cached.hash))
			}
			None => Ok(None),
		}
	}

	/// Record freshly computed hashes in one write transaction.
	/// `now` is the scan time; files modified inside the racy window are skipped.
	pub fn update_hashes(
		&self,
		entries: &[(String, FileStamp, ContentHash)],
		now: i64,
	) -> Result<usize, StateError> {
		let write_txn = self.db.begin_write()?;
		let mut written = 0;
		{
			let mut table = write_txn.open_table(HASH_CACHE_TABLE)?;
			for (path, stamp, hash) in entries {
				if now - stamp.mtime < RACY_WINDOW_SECS {
					continue;
				}
				let bytes = serde_json::to_vec(&CacheEntry { stamp: *stamp, hash: *hash })?;
				table.insert(path.as_str(), bytes.as_slice())?;
				written += 1;
			}
		}
		write_txn.commit()?;
		Ok(written)
	}

	/// Drop cache entries for paths not in `live`
	pub fn prune_hashes(&self, live: &BTreeSet<String>) -> Result<usize, StateError> {
		let stale: Vec<String> = {
			let read_txn = self.db.begin_read()?;
			let table = read_txn.open_table(HASH_CACHE_TABLE)?;
			let mut stale = Vec::new();
			for item in table.iter()? {
				let (key, _) = item?;
				if !live.contains(key.value()) {
					stale.push(key.value().to_string());
				}
			}
			stale
		};
		if stale.is_empty() {
			return Ok(0);
		}
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(HASH_CACHE_TABLE)?;
			for path in &stale {
				let _ = table.remove(path.as_str())?;
			}
		}
		write_txn.commit()?;
		Ok(stale.len())
	}

	/// Latest committed revision (0 before the first commit)
	pub fn head_revision(&self) -> Result<u64, StateError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(HISTORY_TABLE)?;
		let last = table.last()?;
		Ok(last.map(|(k, _)| k.value()).unwrap_or(0))
	}

	/// Store a commit record and its change set in one write transaction
	/// (overwrites an existing record of the same revision)
	pub fn record_commit(&self, record: &HistoryRecord, changes: &ChangeSet) -> Result<(), StateError> {
		let record_bytes = serde_json::to_vec(record)?;
		let changes_bytes = serde_json::to_vec(changes)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(HISTORY_TABLE)?;
			table.insert(record.revision, record_bytes.as_slice())?;
			let mut table = write_txn.open_table(CHANGES_TABLE)?;
			table.insert(record.revision, changes_bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Change set applied by `revision`, if that revision exists
	pub fn changes(&self, revision: u64) -> Result<Option<ChangeSet>, StateError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(CHANGES_TABLE)?;
		match table.get(revision)? {
			Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
			None => Ok(None),
		}
	}

	/// All commit records, oldest first
	pub fn history(&self) -> Result<Vec<HistoryRecord>, StateError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(HISTORY_TABLE)?;
		let mut out = Vec::new();
		for item in table.iter()? {
			let (_, value) = item?;
			out.push(serde_json::from_slice(value.value())?);
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::diff::ChangeOp;
	use crate::types::Entry;

	fn stamp(mtime: i64) -> FileStamp {
		FileStamp { size: 10, mtime, mtime_nsec: 5, ctime: mtime, ctime_nsec: 5, inode: 42 }
	}

	fn record(revision: u64) -> HistoryRecord {
		HistoryRecord {
			revision,
			transaction: Uuid::new_v4(),
			timestamp: 1_700_000_000,
			added: 1,
			modified: 0,
			deleted: 0,
			renamed: 0,
			metadata_updated: 0,
			paths: vec!["a.txt".to_string()],
			message: None,
		}
	}

	fn added(path: &str) -> ChangeSet {
		vec![ChangeOp::Add { path: path.to_string(), entry: Entry::file(ContentHash::of(b"a"), 1, 0o644, 0) }]
			.into_iter()
			.collect()
	}

	#[test]
	fn test_hash_cache_hit_and_miss() {
		let dir = tempfile::tempdir().unwrap();
		let db = StateDb::open(&dir.path().join("state.redb")).unwrap();
		let hash = ContentHash::of(b"content");
		let written = db.update_hashes(&[("a.txt".to_string(), stamp(100), hash)], 1000).unwrap();
		assert_eq!(written, 1);
		assert_eq!(db.cached_hash("a.txt", &stamp(100)).unwrap(), Some(hash));
		assert_eq!(db.cached_hash("a.txt", &stamp(101)).unwrap(), None);
		assert_eq!(db.cached_hash("b.txt", &stamp(100)).unwrap(), None);
	}

	#[test]
	fn test_racy_files_not_cached() {
		let dir = tempfile::tempdir().unwrap();
		let db = StateDb::open(&dir.path().join("state.redb")).unwrap();
		let hash = ContentHash::of(b"content");
		let written = db.update_hashes(&[("a.txt".to_string(), stamp(1000), hash)], 1001).unwrap();
		assert_eq!(written, 0);
		assert_eq!(db.cached_hash("a.txt", &stamp(1000)).unwrap(), None);
	}

	#[test]
	fn test_prune_hashes() {
		let dir = tempfile::tempdir().unwrap();
		let db = StateDb::open(&dir.path().join("state.redb")).unwrap();
		let hash = ContentHash::of(b"x");
		db.update_hashes(
			&[("keep".to_string(), stamp(1), hash), ("gone".to_string(), stamp(1), hash)],
			1000,
		)
		.unwrap();
		let live: BTreeSet<String> = ["keep".to_string()].into_iter().collect();
		assert_eq!(db.prune_hashes(&live).unwrap(), 1);
		assert!(db.cached_hash("keep", &stamp(1)).unwrap().is_some());
		assert!(db.cached_hash("gone", &stamp(1)).unwrap().is_none());
	}

	#[test]
	fn test_history() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.redb");
		{
			let db = StateDb::open(&path).unwrap();
			assert_eq!(db.head_revision().unwrap(), 0);
			db.record_commit(&record(1), &added("a.txt")).unwrap();
			let mut second = record(2);
			second.message = Some("second".to_string());
			db.record_commit(&second, &added("b.txt")).unwrap();
		}
		let db = StateDb::open(&path).unwrap();
		assert_eq!(db.head_revision().unwrap(), 2);
		let history = db.history().unwrap();
		assert_eq!(history.len(), 2);
		assert_eq!(history[0].revision, 1);
		assert_eq!(history[0].message, None);
		assert_eq!(history[1].message.as_deref(), Some("second"));
		assert_eq!(db.changes(2).unwrap(), Some(added("b.txt")));
		assert_eq!(db.changes(3).unwrap(), None);
	}
}

// vim: ts=4
