//! Chunk transfer driver
//!
//! The same loop moves blobs in both directions: a client uploading to the
//! server reads chunks from its tree and hands them to the engine, a client
//! downloading reads chunks from the engine and hands them to a local
//! [`UploadTracker`]. Blobs transfer concurrently; the chunks of one blob go
//! in order, so a failed blob stops at its first bad chunk.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::chunk_tracker::{chunk_len, ChunkAck, NeededBlob, UploadTracker};
use crate::error::SyncError;
use crate::logging::*;
use crate::store::ContentStore;
use crate::types::ContentHash;

/// Default number of blobs in flight
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Something that can produce the bytes of a chunk
#[async_trait]
pub trait ChunkSource: Send + Sync {
	/// Read `len` bytes of blob `hash` starting at `offset`
	async fn read_chunk(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>, SyncError>;
}

/// Something that accepts chunks
#[async_trait]
pub trait ChunkSink: Send + Sync {
	async fn write_chunk(&self, hash: &ContentHash, offset: u64, data: Vec<u8>) -> Result<ChunkAck, SyncError>;
}

/// Summary of a transfer run
#[derive(Debug, Default)]
pub struct TransferReport {
	pub blobs_completed: usize,
	pub chunks_sent: usize,
	pub bytes_sent: u64,
	/// Blobs rejected by the receiver's verification; retry by announcing them again
	pub integrity_failures: Vec<ContentHash>,
}

/// Drives chunk transfers between a source and a sink
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
	concurrency: usize,
}

impl Default for TransferCoordinator {
	fn default() -> Self {
		TransferCoordinator { concurrency: DEFAULT_CONCURRENCY }
	}
}

/// Per-blob outcome
enum BlobOutcome {
	Completed { chunks: usize, bytes: u64 },
	Incomplete { chunks: usize, bytes: u64 },
	IntegrityFailure { hash: ContentHash, chunks: usize, bytes: u64 },
}

impl TransferCoordinator {
	pub fn new(concurrency: usize) -> Self {
		TransferCoordinator { concurrency: concurrency.max(1) }
	}

	/// Send every missing chunk of every needed blob
	///
	/// Integrity failures are collected in the report; any other error stops
	/// the transfer.
	pub async fn transfer(
		&self,
		needed: &[NeededBlob],
		source: &dyn ChunkSource,
		sink: &dyn ChunkSink,
	) -> Result<TransferReport, SyncError> {
		let mut outcomes = stream::iter(needed.iter())
			.map(|blob| send_blob(blob, source, sink))
			.buffer_unordered(self.concurrency);

		let mut report = TransferReport::default();
		while let Some(outcome) = outcomes.next().await {
			match outcome? {
				BlobOutcome::Completed { chunks, bytes } => {
					report.blobs_completed += 1;
					report.chunks_sent += chunks;
					report.bytes_sent += bytes;
				}
				BlobOutcome::Incomplete { chunks, bytes } => {
					report.chunks_sent += chunks;
					report.bytes_sent += bytes;
				}
				BlobOutcome::IntegrityFailure { hash, chunks, bytes } => {
					report.chunks_sent += chunks;
					report.bytes_sent += bytes;
					report.integrity_failures.push(hash);
				}
			}
		}
		debug!(
			"[transfer] {} blobs, {} chunks, {} bytes, {} integrity failures",
			report.blobs_completed,
			report.chunks_sent,
			report.bytes_sent,
			report.integrity_failures.len()
		);
		Ok(report)
	}
}

async fn send_blob(
	blob: &NeededBlob,
	source: &dyn ChunkSource,
	sink: &dyn ChunkSink,
) -> Result<BlobOutcome, SyncError> {
	let mut chunks = 0;
	let mut bytes = 0u64;
	let mut complete = false;
	for &offset in &blob.missing_offsets {
		let len = chunk_len(blob.size, offset);
		let data = source.read_chunk(&blob.hash, offset, len).await?;
		if data.len() as u64 != len {
			return Err(SyncError::protocol(format!(
				"Source returned {} bytes for {}@{}, expected {}",
				data.len(),
				blob.hash.short(),
				offset,
				len
			)));
		}
		chunks += 1;
		bytes += len;
		match sink.write_chunk(&blob.hash, offset, data).await {
			Ok(ack) => complete = ack.complete,
			Err(SyncError::Integrity { hash, .. }) => {
				return Ok(BlobOutcome::IntegrityFailure { hash, chunks, bytes })
			}
			Err(e) => return Err(e),
		}
	}
	if complete {
		Ok(BlobOutcome::Completed { chunks, bytes })
	} else {
		Ok(BlobOutcome::Incomplete { chunks, bytes })
	}
}

/// Serves chunks out of a content store
#[async_trait]
impl ChunkSource for ContentStore {
	async fn read_chunk(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
		Ok(self.read_range(hash, offset, len as usize).await?)
	}
}

/// Receives chunks into a tracked upload
#[async_trait]
impl ChunkSink for UploadTracker {
	async fn write_chunk(&self, hash: &ContentHash, offset: u64, data: Vec<u8>) -> Result<ChunkAck, SyncError> {
		self.put_chunk(hash, offset, &data).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chunk_tracker::CHUNK_SIZE;

	fn blob(len: usize, seed: u8) -> Vec<u8> {
		(0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
	}

	/// Serves fixed bytes for any hash (lets a test lie about content)
	struct Lying(Vec<u8>);

	#[async_trait]
	impl ChunkSource for Lying {
		async fn read_chunk(&self, _hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
			Ok(self.0[offset as usize..(offset + len) as usize].to_vec())
		}
	}

	#[tokio::test]
	async fn test_store_to_store_transfer() {
		let src_dir = tempfile::tempdir().unwrap();
		let dst_dir = tempfile::tempdir().unwrap();
		let source = ContentStore::open(src_dir.path()).await.unwrap();
		let sink = UploadTracker::new(ContentStore::open(dst_dir.path()).await.unwrap());

		let blobs = vec![blob(10, 1), blob(CHUNK_SIZE as usize * 2 + 5, 2), Vec::new()];
		let mut needed = Vec::new();
		for data in &blobs {
			let hash = source.put(data).await.unwrap();
			needed.push(sink.expect(&hash, data.len() as u64).await.unwrap().unwrap());
		}

		let report = TransferCoordinator::new(2).transfer(&needed, &source, &sink).await.unwrap();
		assert_eq!(report.blobs_completed, 3);
		assert_eq!(report.chunks_sent, 1 + 3 + 1);
		assert!(report.integrity_failures.is_empty());
		for data in &blobs {
			assert_eq!(sink.store().get(&ContentHash::of(data)).await.unwrap(), *data);
		}
	}

	#[tokio::test]
	async fn test_only_missing_offsets_are_sent() {
		let src_dir = tempfile::tempdir().unwrap();
		let dst_dir = tempfile::tempdir().unwrap();
		let source = ContentStore::open(src_dir.path()).await.unwrap();
		let sink = UploadTracker::new(ContentStore::open(dst_dir.path()).await.unwrap());

		let data = blob(CHUNK_SIZE as usize * 3, 7);
		let hash = source.put(&data).await.unwrap();
		sink.expect(&hash, data.len() as u64).await.unwrap();
		sink.put_chunk(&hash, 0, &data[..CHUNK_SIZE as usize]).await.unwrap();

		let needed = sink.expect(&hash, data.len() as u64).await.unwrap().unwrap();
		assert_eq!(needed.missing_offsets, vec![CHUNK_SIZE, CHUNK_SIZE * 2]);
		let report = TransferCoordinator::default().transfer(&[needed], &source, &sink).await.unwrap();
		assert_eq!(report.chunks_sent, 2);
		assert_eq!(report.bytes_sent, CHUNK_SIZE * 2);
		assert!(sink.store().has(&hash).await);
	}

	#[tokio::test]
	async fn test_integrity_failure_is_reported_per_blob() {
		let dst_dir = tempfile::tempdir().unwrap();
		let sink = UploadTracker::new(ContentStore::open(dst_dir.path()).await.unwrap());

		let claimed = ContentHash::of(b"honest");
		let needed = sink.expect(&claimed, 6).await.unwrap().unwrap();
		let report = TransferCoordinator::default()
			.transfer(&[needed], &Lying(b"forged".to_vec()), &sink)
			.await
			.unwrap();
		assert_eq!(report.integrity_failures, vec![claimed]);
		assert_eq!(report.blobs_completed, 0);
		assert!(!sink.store().has(&claimed).await);
	}
}

// vim: ts=4
