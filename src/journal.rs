//! Commit journal
//!
//! Before the first live path changes, the full list of swap steps is written
//! to `<data>/journal.json` (temp file, fsync, rename). Writing the journal is
//! the commit point: once it exists the commit will complete, either now or
//! by replay when the repository is next opened. Every step is idempotent so
//! replaying a partially applied journal converges on the committed tree.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs as afs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::diff::{ChangeOp, ChangeSet};
use crate::error::SyncError;
use crate::logging::*;
use crate::state::HistoryRecord;
use crate::transaction::StagedFile;
use crate::types::{ContentHash, EntryKind};
use crate::util;
use crate::validation::{self, to_fs_path};

/// File name of the journal inside the data directory
pub const JOURNAL_FILE: &str = "journal.json";

/// One idempotent swap step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum JournalStep {
	/// Remove the file or symlink at `path` (absent or a directory: nothing to do)
	Remove { path: String },

	/// Rename `<staging>/<staged>` onto `path`, creating parents
	Place { staged: String, path: String, hash: ContentHash },

	/// Set mode and mtime of the file at `path`
	Touch { path: String, mode: u32, mtime: i64, symlink: bool },

	/// Remove `dir` and its ancestors while they are empty
	Prune { dir: String },
}

/// Everything needed to finish a commit after a crash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitJournal {
	pub transaction: Uuid,
	pub staging_dir: PathBuf,
	pub steps: Vec<JournalStep>,
	pub changes: ChangeSet,
	pub history: HistoryRecord,
}

impl CommitJournal {
	/// Order the swap for `changes`
	///
	/// Removals that block a placement (an ancestor file, or entries below a
	/// path that becomes a file) go first, then placements, metadata updates,
	/// the remaining removals, and finally pruning of emptied directories.
	pub fn plan(
		transaction: Uuid,
		staging_dir: &Path,
		changes: &ChangeSet,
		staged: &BTreeMap<String, StagedFile>,
		revision: u64,
	) -> Result<Self, SyncError> {
		let mut placements = Vec::new();
		let mut touches = Vec::new();
		let mut removals = Vec::new();

		for op in changes {
			match op {
				ChangeOp::Add { path, entry } | ChangeOp::Modify { path, entry } => {
					placements.push((path.clone(), entry.hash));
				}
				ChangeOp::Rename { from, to, entry } => {
					placements.push((to.clone(), entry.hash));
					removals.push(from.clone());
				}
				ChangeOp::Delete { path } => removals.push(path.clone()),
				ChangeOp::MetadataUpdate { path, entry } => touches.push(JournalStep::Touch {
					path: path.clone(),
					mode: entry.mode,
					mtime: entry.mtime,
					symlink: entry.kind == EntryKind::Symlink,
				}),
			}
		}

		let placed: BTreeSet<&str> = placements.iter().map(|(p, _)| p.as_str()).collect();
		let blocks = |removed: &str| {
			placed.iter().any(|p| {
				validation::is_descendant(p, removed) || validation::is_descendant(removed, p)
			})
		};
		let (blocking, remaining): (Vec<String>, Vec<String>) =
			removals.into_iter().partition(|r| blocks(r));

		let mut steps = Vec::new();
		steps.extend(blocking.iter().map(|path| JournalStep::Remove { path: path.clone() }));
		for (path, hash) in &placements {
			let staged_file = staged.get(path).ok_or_else(|| {
				SyncError::protocol_at("Placement has no staged content", path.as_str())
			})?;
			if Some(staged_file.hash) != *hash {
				return Err(SyncError::protocol_at("Staged content does not match placement", path.as_str()));
			}
			steps.push(JournalStep::Place {
				staged: staged_file.name.clone(),
				path: path.clone(),
				hash: staged_file.hash,
			});
		}
		steps.extend(touches);
		steps.extend(remaining.iter().map(|path| JournalStep::Remove { path: path.clone() }));

		let parents: BTreeSet<&str> = blocking
			.iter()
			.chain(remaining.iter())
			.filter_map(|p| p.rsplit_once('/').map(|(dir, _)| dir))
			.collect();
		// Deepest first so children are gone before their parents are tried
		let mut parents: Vec<&str> = parents.into_iter().collect();
		parents.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
		steps.extend(parents.into_iter().map(|dir| JournalStep::Prune { dir: dir.to_string() }));

		let counts = changes.counts();
		let history = HistoryRecord {
			revision,
			transaction,
			timestamp: util::unix_now(),
			added: counts.added,
			modified: counts.modified,
			deleted: counts.deleted,
			renamed: counts.renamed,
			metadata_updated: counts.metadata_updated,
			paths: changes.touched_paths().into_iter().map(String::from).collect(),
			message: None,
		};

		Ok(CommitJournal {
			transaction,
			staging_dir: staging_dir.to_path_buf(),
			steps,
			changes: changes.clone(),
			history,
		})
	}

	/// Attach the client's commit message to the history record
	pub fn with_message(mut self, message: Option<String>) -> Self {
		self.history.message = message;
		self
	}

	/// Persist atomically at `path`
	pub async fn write(&self, path: &Path) -> Result<(), SyncError> {
		let bytes = serde_json::to_vec_pretty(self)
			.map_err(|e| SyncError::protocol(format!("Cannot encode journal: {}", e)))?;
		let tmp = path.with_extension("json.tmp");
		let written = async {
			let mut file = afs::File::create(&tmp).await?;
			file.write_all(&bytes).await?;
			file.sync_all().await?;
			afs::rename(&tmp, path).await?;
			if let Some(parent) = path.parent() {
				afs::File::open(parent).await?.sync_all().await?;
			}
			Ok::<(), io::Error>(())
		}
		.await;
		written.map_err(|e| SyncError::io(path, e))
	}

	/// Load the journal at `path`, if any
	pub async fn load(path: &Path) -> Result<Option<Self>, SyncError> {
		match afs::read(path).await {
			Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| SyncError::Protocol {
				message: format!("Corrupt commit journal: {}", e),
				paths: vec![path.display().to_string()],
			}),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(SyncError::io(path, e)),
		}
	}

	pub async fn remove(path: &Path) -> Result<(), SyncError> {
		match afs::remove_file(path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(SyncError::io(path, e)),
		}
	}

	/// Run every step against the live tree at `root`
	pub async fn apply(&self, root: &Path) -> Result<(), SyncError> {
		for step in &self.steps {
			apply_step(root, &self.staging_dir, step).await?;
		}
		info!(
			"[journal] applied revision {} ({} steps) for transaction {}",
			self.history.revision,
			self.steps.len(),
			self.transaction
		);
		Ok(())
	}
}

async fn apply_step(root: &Path, staging: &Path, step: &JournalStep) -> Result<(), SyncError> {
	match step {
		JournalStep::Remove { path } => {
			let live = to_fs_path(root, path);
			match afs::symlink_metadata(&live).await {
				Ok(meta) if meta.is_dir() => Ok(()),
				Ok(_) => match afs::remove_file(&live).await {
					Ok(()) => Ok(()),
					Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
					Err(e) => Err(SyncError::io(&live, e)),
				},
				Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
				Err(e) => Err(SyncError::io(&live, e)),
			}
		}
		JournalStep::Place { staged, path, hash } => {
			let source = staging.join(staged);
			let live = to_fs_path(root, path);
			match afs::symlink_metadata(&source).await {
				Ok(_) => {}
				Err(e) if e.kind() == io::ErrorKind::NotFound => {
					// Already renamed by an earlier run of this journal
					if afs::symlink_metadata(&live).await.is_err() {
						warn!("[journal] staged {} for {} ({}) is gone", staged, path, hash.short());
					}
					return Ok(());
				}
				Err(e) => return Err(SyncError::io(&source, e)),
			}
			if let Some(parent) = live.parent() {
				afs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
			}
			// A directory emptied by the blocking removals gives way to the file
			if let Ok(meta) = afs::symlink_metadata(&live).await {
				if meta.is_dir() {
					afs::remove_dir(&live).await.map_err(|e| SyncError::io(&live, e))?;
				}
			}
			afs::rename(&source, &live).await.map_err(|e| SyncError::io(&live, e))
		}
		JournalStep::Touch { path, mode, mtime, symlink } => {
			let live = to_fs_path(root, path);
			let time = filetime::FileTime::from_system_time(util::system_time(*mtime));
			if *symlink {
				return filetime::set_symlink_file_times(&live, time, time)
					.map_err(|e| SyncError::io(&live, e));
			}
			afs::set_permissions(&live, std::fs::Permissions::from_mode(*mode))
				.await
				.map_err(|e| SyncError::io(&live, e))?;
			filetime::set_file_mtime(&live, time).map_err(|e| SyncError::io(&live, e))
		}
		JournalStep::Prune { dir } => {
			let mut current = Some(dir.as_str());
			while let Some(d) = current {
				let live = to_fs_path(root, d);
				match afs::remove_dir(&live).await {
					Ok(()) => trace!("[journal] pruned {}", live.display()),
					// Not empty, already gone, or replaced by a file: stop here
					Err(_) => break,
				}
				current = d.rsplit_once('/').map(|(parent, _)| parent);
			}
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Entry;

	fn staged(entries: &[(&str, &str, &[u8])]) -> BTreeMap<String, StagedFile> {
		entries
			.iter()
			.map(|(path, name, data)| {
				(path.to_string(), StagedFile { name: name.to_string(), hash: ContentHash::of(data) })
			})
			.collect()
	}

	fn file(data: &[u8]) -> Entry {
		Entry::file(ContentHash::of(data), data.len() as u64, 0o644, 1_600_000_000)
	}

	#[test]
	fn test_plan_orders_blocking_removals_first() {
		let changes: ChangeSet = vec![
			ChangeOp::Delete { path: "a".to_string() },
			ChangeOp::Add { path: "a/b".to_string(), entry: file(b"b") },
			ChangeOp::Delete { path: "x/y".to_string() },
		]
		.into_iter()
		.collect();
		let staged = staged(&[("a/b", "000001", b"b")]);
		let journal = CommitJournal::plan(Uuid::new_v4(), Path::new("/s"), &changes, &staged, 3).unwrap();
		assert_eq!(
			journal.steps,
			vec![
				JournalStep::Remove { path: "a".to_string() },
				JournalStep::Place {
					staged: "000001".to_string(),
					path: "a/b".to_string(),
					hash: ContentHash::of(b"b")
				},
				JournalStep::Remove { path: "x/y".to_string() },
				JournalStep::Prune { dir: "x".to_string() },
			]
		);
		assert_eq!(journal.history.revision, 3);
		assert_eq!(journal.history.added, 1);
	}

	#[test]
	fn test_plan_requires_staged_content() {
		let changes: ChangeSet =
			vec![ChangeOp::Add { path: "f".to_string(), entry: file(b"f") }].into_iter().collect();
		let err = CommitJournal::plan(Uuid::new_v4(), Path::new("/s"), &changes, &BTreeMap::new(), 1)
			.unwrap_err();
		assert_eq!(err.paths(), vec!["f".to_string()]);
	}

	#[tokio::test]
	async fn test_apply_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("tree");
		let staging = dir.path().join("staging");
		std::fs::create_dir_all(root.join("old/dir")).unwrap();
		std::fs::create_dir_all(&staging).unwrap();
		std::fs::write(root.join("old/dir/gone"), b"gone").unwrap();
		std::fs::write(root.join("keep"), b"keep").unwrap();
		std::fs::write(staging.join("000000"), b"new").unwrap();

		let changes: ChangeSet = vec![
			ChangeOp::Add { path: "fresh/new".to_string(), entry: file(b"new") },
			ChangeOp::MetadataUpdate { path: "keep".to_string(), entry: file(b"keep") },
			ChangeOp::Delete { path: "old/dir/gone".to_string() },
		]
		.into_iter()
		.collect();
		let staged = staged(&[("fresh/new", "000000", b"new")]);
		let journal = CommitJournal::plan(Uuid::new_v4(), &staging, &changes, &staged, 1).unwrap();

		journal.apply(&root).await.unwrap();
		// Crash after the swap but before cleanup: replay must converge
		journal.apply(&root).await.unwrap();

		assert_eq!(std::fs::read(root.join("fresh/new")).unwrap(), b"new");
		assert!(!root.join("old").exists());
		let mtime = filetime::FileTime::from_last_modification_time(
			&std::fs::metadata(root.join("keep")).unwrap(),
		);
		assert_eq!(mtime.unix_seconds(), 1_600_000_000);
	}

	#[tokio::test]
	async fn test_write_and_load() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(JOURNAL_FILE);
		assert!(CommitJournal::load(&path).await.unwrap().is_none());

		let journal =
			CommitJournal::plan(Uuid::new_v4(), dir.path(), &ChangeSet::new(), &BTreeMap::new(), 9)
				.unwrap();
		journal.write(&path).await.unwrap();
		assert_eq!(CommitJournal::load(&path).await.unwrap(), Some(journal));
		CommitJournal::remove(&path).await.unwrap();
		assert!(!path.exists());
	}
}

// vim: ts=4
