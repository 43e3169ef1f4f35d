//! Reference client
//!
//! Drives a [`SyncEngine`] from the client side: `push` uploads a local
//! tree's changes against a baseline, `pull` brings a local tree up to the
//! server's live manifest. Both directions move bytes through the same
//! [`TransferCoordinator`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as afs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::chunk_tracker::{chunk_offsets, ChunkAck, NeededBlob, UploadTracker};
use crate::config::DEFAULT_DATA_DIR_NAME;
use crate::diff::{self, ChangeOp};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::logging::*;
use crate::manifest::{Manifest, ManifestBuilder};
use crate::repository::{CommitOutcome, SyncPlan};
use crate::store::ContentStore;
use crate::transfer::{ChunkSink, ChunkSource, TransferCoordinator, TransferReport};
use crate::types::{ContentHash, Entry, EntryKind};
use crate::util;
use crate::validation::to_fs_path;

/// Times a blob rejected by verification is sent again
const INTEGRITY_RETRIES: usize = 2;

/// Serves chunks out of a local tree
pub struct TreeSource {
	root: PathBuf,
	/// Content hash -> a path holding it
	paths: BTreeMap<ContentHash, (String, EntryKind)>,
}

impl TreeSource {
	pub fn new(root: impl Into<PathBuf>, manifest: &Manifest) -> Self {
		let mut paths = BTreeMap::new();
		for (path, entry) in manifest.iter() {
			if let (Some(hash), true) = (entry.hash, entry.is_present()) {
				paths.entry(hash).or_insert_with(|| (path.clone(), entry.kind));
			}
		}
		TreeSource { root: root.into(), paths }
	}
}

#[async_trait]
impl ChunkSource for TreeSource {
	async fn read_chunk(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
		let (path, kind) = self
			.paths
			.get(hash)
			.ok_or_else(|| SyncError::protocol(format!("No local path holds blob {}", hash)))?;
		let fs_path = to_fs_path(&self.root, path);
		if *kind == EntryKind::Symlink {
			let target = afs::read_link(&fs_path).await.map_err(|e| SyncError::io(&fs_path, e))?;
			let bytes = target.to_string_lossy().into_owned().into_bytes();
			let end = (offset + len) as usize;
			return bytes
				.get(offset as usize..end)
				.map(|slice| slice.to_vec())
				.ok_or_else(|| SyncError::protocol_at("Symlink target changed", path.as_str()));
		}

		let read = async {
			let mut file = afs::File::open(&fs_path).await?;
			file.seek(std::io::SeekFrom::Start(offset)).await?;
			let mut buf = vec![0u8; len as usize];
			file.read_exact(&mut buf).await?;
			Ok::<_, std::io::Error>(buf)
		};
		read.await.map_err(|e| SyncError::io(&fs_path, e))
	}
}

/// Uploads chunks into an engine transaction
pub struct EngineSink<'a> {
	engine: &'a SyncEngine,
	transaction_id: Uuid,
}

impl<'a> EngineSink<'a> {
	pub fn new(engine: &'a SyncEngine, transaction_id: Uuid) -> Self {
		EngineSink { engine, transaction_id }
	}
}

#[async_trait]
impl ChunkSink for EngineSink<'_> {
	async fn write_chunk(&self, hash: &ContentHash, offset: u64, data: Vec<u8>) -> Result<ChunkAck, SyncError> {
		self.engine.put_chunk(self.transaction_id, hash, offset, &data).await
	}
}

/// Downloads chunks from a repository
pub struct EngineSource<'a> {
	engine: &'a SyncEngine,
	repository: String,
}

impl<'a> EngineSource<'a> {
	pub fn new(engine: &'a SyncEngine, repository: impl Into<String>) -> Self {
		EngineSource { engine, repository: repository.into() }
	}
}

#[async_trait]
impl ChunkSource for EngineSource<'_> {
	async fn read_chunk(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
		let data = self.engine.read_chunk(&self.repository, hash, offset).await?;
		if data.len() as u64 != len {
			return Err(SyncError::protocol(format!(
				"Server sent {} bytes for {}@{}, expected {}",
				data.len(),
				hash.short(),
				offset,
				len
			)));
		}
		Ok(data)
	}
}

/// Result of a push
#[derive(Debug)]
pub struct PushReport {
	pub plan: SyncPlan,
	pub transfer: TransferReport,
	pub outcome: CommitOutcome,
	/// The manifest that was pushed; the next baseline once conflicts are settled
	pub target: Manifest,
}

/// Result of a pull
#[derive(Debug)]
pub struct PullReport {
	/// The server manifest the local tree now matches; the next baseline
	pub manifest: Manifest,
	pub transfer: TransferReport,
	pub applied: usize,
}

/// Scan a client tree (the data directory name is skipped)
pub async fn scan(root: &Path) -> Result<Manifest, SyncError> {
	let exclusion = Arc::new(ExclusionEngine::reserved_only(DEFAULT_DATA_DIR_NAME)?);
	ManifestBuilder::new(root).with_exclusion(exclusion).build_async().await
}

/// Push the tree at `root` to `repository`, diffing against `baseline`
///
/// Clean paths are committed even when others conflict; conflicts are in the
/// returned plan.
pub async fn push(
	engine: &SyncEngine,
	repository: &str,
	root: &Path,
	baseline: &Manifest,
) -> Result<PushReport, SyncError> {
	let target = scan(root).await?;
	let plan = engine.begin_sync(repository, baseline.clone(), target.clone()).await?;
	let source = TreeSource::new(root, &target);
	let sink = EngineSink::new(engine, plan.transaction_id);
	let coordinator = TransferCoordinator::default();

	let mut transfer = coordinator.transfer(&plan.needed, &source, &sink).await?;
	for _ in 0..INTEGRITY_RETRIES {
		if transfer.integrity_failures.is_empty() {
			break;
		}
		let retry = restart(&plan.needed, &transfer.integrity_failures);
		warn!("Resending {} blobs that failed verification", retry.len());
		let again = coordinator.transfer(&retry, &source, &sink).await?;
		transfer.blobs_completed += again.blobs_completed;
		transfer.chunks_sent += again.chunks_sent;
		transfer.bytes_sent += again.bytes_sent;
		transfer.integrity_failures = again.integrity_failures;
	}

	let outcome = engine.commit_sync(plan.transaction_id, None).await?;
	info!(
		"Pushed {} to {}: revision {}, {} ops, {} conflicts",
		root.display(),
		repository,
		outcome.revision,
		outcome.applied,
		plan.conflicts.len()
	);
	Ok(PushReport { plan, transfer, outcome, target })
}

/// Every chunk of the blobs in `failed`
fn restart(needed: &[NeededBlob], failed: &[ContentHash]) -> Vec<NeededBlob> {
	needed
		.iter()
		.filter(|blob| failed.contains(&blob.hash))
		.map(|blob| NeededBlob { hash: blob.hash, size: blob.size, missing_offsets: chunk_offsets(blob.size) })
		.collect()
}

/// Make the tree at `root` match `repository`'s live manifest
///
/// Blobs are downloaded into a local store under the data directory first,
/// then the tree is updated. Local edits are overwritten.
pub async fn pull(engine: &SyncEngine, repository: &str, root: &Path) -> Result<PullReport, SyncError> {
	let remote = engine.get_manifest(repository).await?;
	let local = scan(root).await?;
	let changes = diff::diff(&local, &remote);

	let store = ContentStore::open(&root.join(DEFAULT_DATA_DIR_NAME)).await?;
	let tracker = UploadTracker::new(store);
	let mut needed = Vec::new();
	for (hash, size) in changes
		.iter()
		.filter(|op| op.places_content())
		.filter_map(|op| op.entry())
		.filter_map(|e| e.hash.map(|h| (h, e.size)))
		.collect::<BTreeMap<_, _>>()
	{
		if let Some(blob) = tracker.expect(&hash, size).await? {
			needed.push(blob);
		}
	}
	let source = EngineSource::new(engine, repository);
	let transfer = TransferCoordinator::default().transfer(&needed, &source, &tracker).await?;
	if !transfer.integrity_failures.is_empty() {
		return Err(SyncError::MissingBlobs { hashes: transfer.integrity_failures.clone() });
	}

	let store = tracker.store();
	let mut applied = 0;
	// Removals first so files can replace directories and the other way round
	for op in changes.iter() {
		match op {
			ChangeOp::Delete { path } | ChangeOp::Rename { from: path, .. } => {
				remove_local(root, path).await?;
				applied += 1;
			}
			_ => {}
		}
	}
	for op in changes.iter() {
		match op {
			ChangeOp::Add { path, entry } | ChangeOp::Modify { path, entry } | ChangeOp::Rename { to: path, entry, .. } => {
				place_local(store, root, path, entry).await?;
				applied += 1;
			}
			ChangeOp::MetadataUpdate { path, entry } => {
				set_metadata(&to_fs_path(root, path), entry)?;
				applied += 1;
			}
			ChangeOp::Delete { .. } => {}
		}
	}
	info!("Pulled {} into {}: {} ops", repository, root.display(), applied);
	Ok(PullReport { manifest: remote, transfer, applied })
}

async fn remove_local(root: &Path, path: &str) -> Result<(), SyncError> {
	let fs_path = to_fs_path(root, path);
	match afs::remove_file(&fs_path).await {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
		Err(e) => return Err(SyncError::io(&fs_path, e)),
	}
	// Prune parents left empty
	let mut parent = fs_path.parent();
	while let Some(dir) = parent {
		if dir == root || afs::remove_dir(dir).await.is_err() {
			break;
		}
		parent = dir.parent();
	}
	Ok(())
}

async fn place_local(store: &ContentStore, root: &Path, path: &str, entry: &Entry) -> Result<(), SyncError> {
	let Some(hash) = entry.hash else {
		return Err(SyncError::protocol_at("Placement without content", path));
	};
	let fs_path = to_fs_path(root, path);
	if let Some(parent) = fs_path.parent() {
		afs::create_dir_all(parent).await.map_err(|e| SyncError::io(parent, e))?;
	}
	let scratch = store.temp_path();
	match entry.kind {
		EntryKind::Symlink => {
			let target = String::from_utf8(store.get(&hash).await?)
				.map_err(|_| SyncError::protocol_at("Symlink target is not valid UTF-8", path))?;
			afs::symlink(&target, &scratch).await.map_err(|e| SyncError::io(&scratch, e))?;
		}
		_ => {
			store.export(&hash, &scratch).await?;
			set_metadata(&scratch, entry)?;
		}
	}
	if let Ok(meta) = afs::symlink_metadata(&fs_path).await {
		if meta.is_dir() {
			afs::remove_dir(&fs_path).await.map_err(|e| SyncError::io(&fs_path, e))?;
		}
	}
	afs::rename(&scratch, &fs_path).await.map_err(|e| SyncError::io(&fs_path, e))
}

fn set_metadata(fs_path: &Path, entry: &Entry) -> Result<(), SyncError> {
	let mtime = filetime::FileTime::from_system_time(util::system_time(entry.mtime));
	if entry.kind == EntryKind::Symlink {
		return filetime::set_symlink_file_times(fs_path, mtime, mtime).map_err(|e| SyncError::io(fs_path, e));
	}
	std::fs::set_permissions(fs_path, std::fs::Permissions::from_mode(entry.mode))
		.map_err(|e| SyncError::io(fs_path, e))?;
	filetime::set_file_mtime(fs_path, mtime).map_err(|e| SyncError::io(fs_path, e))
}


// vim: ts=4
