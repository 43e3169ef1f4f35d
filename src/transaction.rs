//! Sync transactions
//!
//! A transaction carries one client's baseline and target through
//! `received -> diffed -> resolved(clean|conflict) -> staged -> committed`,
//! or to `aborted` from any state before `committed`. Staging copies every
//! blob the accepted change set places out of the content store into
//! `<data>/staging/<id>/`, verifying digests and applying mode and mtime,
//! so the commit swap itself only renames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs as afs;
use uuid::Uuid;

use crate::conflict::Resolution;
use crate::diff::ChangeOp;
use crate::error::SyncError;
use crate::logging::*;
use crate::manifest::Manifest;
use crate::store::ContentStore;
use crate::types::{ContentHash, Entry, EntryKind};
use crate::util;

/// Whether resolution rejected any path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
	Clean,
	Conflict,
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
	Received,
	Diffed,
	Resolved(ResolutionStatus),
	Staged,
	Committed,
	Aborted,
}

impl TransactionState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, TransactionState::Committed | TransactionState::Aborted)
	}
}

impl fmt::Display for TransactionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransactionState::Received => write!(f, "received"),
			TransactionState::Diffed => write!(f, "diffed"),
			TransactionState::Resolved(ResolutionStatus::Clean) => write!(f, "resolved (clean)"),
			TransactionState::Resolved(ResolutionStatus::Conflict) => write!(f, "resolved (conflict)"),
			TransactionState::Staged => write!(f, "staged"),
			TransactionState::Committed => write!(f, "committed"),
			TransactionState::Aborted => write!(f, "aborted"),
		}
	}
}

/// A file or symlink prepared in staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
	/// File name inside the transaction's staging directory
	pub name: String,
	pub hash: ContentHash,
}

/// One in-flight sync attempt
#[derive(Debug)]
pub struct Transaction {
	pub id: Uuid,
	state: TransactionState,
	baseline: Manifest,
	target: Manifest,
	resolution: Resolution,
	/// Blobs the client still has to send, by hash
	needed: BTreeMap<ContentHash, u64>,
	staging_dir: PathBuf,
	/// Live path -> staged content
	staged: BTreeMap<String, StagedFile>,
	last_activity: Instant,
}

impl Transaction {
	/// A validated request; `staging_root` is `<data>/staging`
	pub fn new(baseline: Manifest, target: Manifest, staging_root: &Path) -> Self {
		let id = Uuid::new_v4();
		Transaction {
			id,
			state: TransactionState::Received,
			baseline,
			target,
			resolution: Resolution::default(),
			needed: BTreeMap::new(),
			staging_dir: staging_root.join(id.to_string()),
			staged: BTreeMap::new(),
			last_activity: Instant::now(),
		}
	}

	pub fn state(&self) -> TransactionState {
		self.state
	}

	pub fn baseline(&self) -> &Manifest {
		&self.baseline
	}

	pub fn target(&self) -> &Manifest {
		&self.target
	}

	pub fn resolution(&self) -> &Resolution {
		&self.resolution
	}

	pub fn staging_dir(&self) -> &Path {
		&self.staging_dir
	}

	pub fn staged(&self) -> &BTreeMap<String, StagedFile> {
		&self.staged
	}

	pub fn touch(&mut self) {
		self.last_activity = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.elapsed()
	}

	/// Fail unless the transaction is in one of `allowed`
	pub fn require(&self, operation: &'static str, allowed: &[TransactionState]) -> Result<(), SyncError> {
		if allowed.contains(&self.state) {
			Ok(())
		} else {
			Err(SyncError::InvalidState { id: self.id, state: self.state, operation })
		}
	}

	/// Blobs still expected from the client
	pub fn needs(&self, hash: &ContentHash) -> Option<u64> {
		self.needed.get(hash).copied()
	}

	pub fn mark_diffed(&mut self) {
		self.state = TransactionState::Diffed;
	}

	/// Record the resolution and the blobs the accepted changes need
	pub fn resolve(&mut self, resolution: Resolution) -> ResolutionStatus {
		self.needed = resolution
			.changes
			.iter()
			.filter(|op| op.places_content())
			.filter_map(|op| op.entry())
			.filter_map(|e| e.hash.map(|h| (h, e.size)))
			.collect();
		let status = if resolution.is_clean() {
			ResolutionStatus::Clean
		} else {
			ResolutionStatus::Conflict
		};
		self.resolution = resolution;
		self.state = TransactionState::Resolved(status);
		status
	}

	/// Sizes of every blob the accepted changes place
	pub fn required_blobs(&self) -> &BTreeMap<ContentHash, u64> {
		&self.needed
	}

	/// Blobs from `required_blobs` the store does not hold
	pub async fn missing_blobs(&self, store: &ContentStore) -> Vec<ContentHash> {
		let mut missing = Vec::new();
		for hash in self.needed.keys() {
			if !store.has(hash).await {
				missing.push(*hash);
			}
		}
		missing
	}

	/// Copy every placed blob into staging
	pub async fn stage(&mut self, store: &ContentStore) -> Result<(), SyncError> {
		self.require(
			"stage",
			&[
				TransactionState::Resolved(ResolutionStatus::Clean),
				TransactionState::Resolved(ResolutionStatus::Conflict),
			],
		)?;
		let missing = self.missing_blobs(store).await;
		if !missing.is_empty() {
			return Err(SyncError::MissingBlobs { hashes: missing });
		}

		afs::create_dir_all(&self.staging_dir).await.map_err(|e| SyncError::io(&self.staging_dir, e))?;
		let mut staged = BTreeMap::new();
		for (idx, op) in self.resolution.changes.iter().enumerate() {
			if !op.places_content() {
				continue;
			}
			let (path, entry) = match op {
				ChangeOp::Add { path, entry } | ChangeOp::Modify { path, entry } => (path, entry),
				ChangeOp::Rename { to, entry, .. } => (to, entry),
				_ => continue,
			};
			let Some(hash) = entry.hash else { continue };
			let name = format!("{:06}", idx);
			stage_entry(store, entry, &hash, &self.staging_dir.join(&name)).await?;
			staged.insert(path.clone(), StagedFile { name, hash });
		}
		debug!("[tx {}] staged {} entries", self.id, staged.len());
		self.staged = staged;
		self.state = TransactionState::Staged;
		Ok(())
	}

	pub fn mark_committed(&mut self) {
		self.state = TransactionState::Committed;
	}

	/// Move to `aborted` and delete staging. Aborting twice is a no-op.
	pub async fn abort(&mut self) -> Result<(), SyncError> {
		if self.state == TransactionState::Aborted {
			return Ok(());
		}
		self.require(
			"abort",
			&[
				TransactionState::Received,
				TransactionState::Diffed,
				TransactionState::Resolved(ResolutionStatus::Clean),
				TransactionState::Resolved(ResolutionStatus::Conflict),
				TransactionState::Staged,
			],
		)?;
		self.state = TransactionState::Aborted;
		self.discard_staging().await
	}

	pub async fn discard_staging(&mut self) -> Result<(), SyncError> {
		self.staged.clear();
		match afs::remove_dir_all(&self.staging_dir).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(SyncError::io(&self.staging_dir, e)),
		}
	}
}

/// Write one entry into staging with its final mode and mtime
async fn stage_entry(
	store: &ContentStore,
	entry: &Entry,
	hash: &ContentHash,
	dest: &Path,
) -> Result<(), SyncError> {
	match entry.kind {
		EntryKind::File => {
			store.export(hash, dest).await?;
			afs::set_permissions(dest, std::fs::Permissions::from_mode(entry.mode))
				.await
				.map_err(|e| SyncError::io(dest, e))?;
			let mtime = filetime::FileTime::from_system_time(util::system_time(entry.mtime));
			filetime::set_file_mtime(dest, mtime).map_err(|e| SyncError::io(dest, e))?;
		}
		EntryKind::Symlink => {
			let bytes = store.get(hash).await?;
			let actual = ContentHash::of(&bytes);
			if actual != *hash {
				return Err(SyncError::Integrity { hash: *hash, actual });
			}
			let target = String::from_utf8(bytes).map_err(|_| {
				SyncError::protocol(format!("Symlink target {} is not valid UTF-8", hash))
			})?;
			afs::symlink(&target, dest).await.map_err(|e| SyncError::io(dest, e))?;
		}
		EntryKind::Deleted | EntryKind::Error => {
			return Err(SyncError::protocol(format!("Cannot stage a {} entry", entry.kind)));
		}
	}
	Ok(())
}


// vim: ts=4
