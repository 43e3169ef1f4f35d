//! Upload tracking for chunked blob transfers
//!
//! Every blob is cut into fixed `CHUNK_SIZE` pieces addressed by offset. An
//! upload writes its chunks into `<store>/partial/<hash>` and records which
//! offsets arrived. When the last one lands the file is hashed and either
//! moved into the store or discarded as an integrity failure.
//!
//! Uploads are keyed by hash, not by transaction, so an upload interrupted
//! with its transaction resumes in the next one from the missing offsets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs as afs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{StoreError, SyncError};
use crate::logging::*;
use crate::store::ContentStore;
use crate::types::ContentHash;

/// Transfer unit
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Chunk offsets of a blob; an empty blob is one empty chunk at offset 0
pub fn chunk_offsets(size: u64) -> Vec<u64> {
	if size == 0 {
		return vec![0];
	}
	(0..size.div_ceil(CHUNK_SIZE)).map(|i| i * CHUNK_SIZE).collect()
}

/// Length of the chunk at `offset`
pub fn chunk_len(size: u64, offset: u64) -> u64 {
	CHUNK_SIZE.min(size.saturating_sub(offset))
}

/// A blob the receiver still needs, with the chunks it lacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeededBlob {
	pub hash: ContentHash,
	pub size: u64,
	pub missing_offsets: Vec<u64>,
}

/// Receiver's answer to a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
	pub hash: ContentHash,
	/// The blob is verified and in the store
	pub complete: bool,
	pub missing_offsets: Vec<u64>,
}

/// An incomplete upload
#[derive(Debug)]
struct PartialUpload {
	size: u64,
	path: PathBuf,
	received: BTreeSet<u64>,
	/// Handed to the store; late duplicates of its chunks are acknowledged
	finished: bool,
}

impl PartialUpload {
	fn missing(&self) -> Vec<u64> {
		chunk_offsets(self.size).into_iter().filter(|o| !self.received.contains(o)).collect()
	}
}

/// Per-repository upload bookkeeping
#[derive(Debug)]
pub struct UploadTracker {
	store: ContentStore,
	uploads: Mutex<BTreeMap<ContentHash, Arc<Mutex<PartialUpload>>>>,
}

impl UploadTracker {
	pub fn new(store: ContentStore) -> Self {
		UploadTracker { store, uploads: Mutex::new(BTreeMap::new()) }
	}

	pub fn store(&self) -> &ContentStore {
		&self.store
	}

	/// Register interest in a blob. `None` if the store already has it,
	/// otherwise the offsets still to be sent.
	pub async fn expect(&self, hash: &ContentHash, size: u64) -> Result<Option<NeededBlob>, SyncError> {
		if self.store.has(hash).await {
			return Ok(None);
		}
		self.store.check_size(hash, size)?;

		let mut uploads = self.uploads.lock().await;
		let existing = uploads.get(hash).cloned();
		let upload = match existing {
			Some(existing) => {
				let (existing_size, existing_path) = {
					let partial = existing.lock().await;
					(partial.size, partial.path.clone())
				};
				if existing_size != size {
					// Same hash, different size: one of the claims is wrong; restart
					warn!(
						"[upload] {} re-announced with size {} (was {}), restarting",
						hash.short(),
						size,
						existing_size
					);
					uploads.remove(hash);
					let _ = afs::remove_file(&existing_path).await;
					self.insert_new(&mut uploads, hash, size)
				} else {
					existing
				}
			}
			None => self.insert_new(&mut uploads, hash, size),
		};
		drop(uploads);

		let missing = upload.lock().await.missing();
		Ok(Some(NeededBlob { hash: *hash, size, missing_offsets: missing }))
	}

	fn insert_new(
		&self,
		uploads: &mut BTreeMap<ContentHash, Arc<Mutex<PartialUpload>>>,
		hash: &ContentHash,
		size: u64,
	) -> Arc<Mutex<PartialUpload>> {
		let upload = Arc::new(Mutex::new(PartialUpload {
			size,
			path: self.store.partial_dir().join(hash.to_hex()),
			received: BTreeSet::new(),
			finished: false,
		}));
		uploads.insert(*hash, upload.clone());
		upload
	}

	/// Accept one chunk
	///
	/// The offset must be chunk-aligned and the length must be exactly the
	/// chunk's length. On the last chunk the blob is verified; a mismatch
	/// discards the partial and returns `SyncError::Integrity`.
	pub async fn put_chunk(
		&self,
		hash: &ContentHash,
		offset: u64,
		data: &[u8],
	) -> Result<ChunkAck, SyncError> {
		let upload = self.uploads.lock().await.get(hash).cloned();
		let Some(upload) = upload else {
			if self.store.has(hash).await {
				return Ok(ChunkAck { hash: *hash, complete: true, missing_offsets: vec![] });
			}
			return Err(SyncError::protocol(format!("No upload expected for blob {}", hash)));
		};

		let mut partial = upload.lock().await;
		if partial.finished {
			let complete = self.store.has(hash).await;
			return Ok(ChunkAck { hash: *hash, complete, missing_offsets: vec![] });
		}
		if offset % CHUNK_SIZE != 0 || (offset >= partial.size && !(offset == 0 && partial.size == 0)) {
			return Err(SyncError::protocol(format!(
				"Offset {} is not a chunk of blob {} ({} bytes)",
				offset, hash, partial.size
			)));
		}
		let expected_len = chunk_len(partial.size, offset);
		if data.len() as u64 != expected_len {
			return Err(SyncError::protocol(format!(
				"Chunk {}@{} has {} bytes, expected {}",
				hash.short(),
				offset,
				data.len(),
				expected_len
			)));
		}

		write_at(&partial.path, partial.size, offset, data)
			.await
			.map_err(|e| SyncError::io(&partial.path, e))?;
		partial.received.insert(offset);
		trace!("[upload] {} chunk {} ({} bytes)", hash.short(), offset, data.len());

		let missing = partial.missing();
		if !missing.is_empty() {
			return Ok(ChunkAck { hash: *hash, complete: false, missing_offsets: missing });
		}

		let path = partial.path.clone();
		partial.finished = true;
		drop(partial);
		self.uploads.lock().await.remove(hash);
		match self.store.commit_file(&path, hash).await {
			Ok(()) => {
				debug!("[upload] {} complete", hash.short());
				Ok(ChunkAck { hash: *hash, complete: true, missing_offsets: vec![] })
			}
			Err(StoreError::Integrity { expected, actual }) => {
				warn!("[upload] {} failed verification (got {})", expected.short(), actual.short());
				Err(SyncError::Integrity { hash: expected, actual })
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Hashes with an upload in progress (kept alive by garbage collection)
	pub async fn in_flight(&self) -> BTreeSet<ContentHash> {
		self.uploads.lock().await.keys().copied().collect()
	}
}

async fn write_at(path: &std::path::Path, size: u64, offset: u64, data: &[u8]) -> std::io::Result<()> {
	let mut file = afs::OpenOptions::new().write(true).create(true).truncate(false).open(path).await?;
	if file.metadata().await?.len() != size {
		file.set_len(size).await?;
	}
	file.seek(SeekFrom::Start(offset)).await?;
	file.write_all(data).await?;
	file.flush().await?;
	file.sync_data().await
}


// vim: ts=4
