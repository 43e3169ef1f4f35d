//! Content-addressed blob store
//!
//! Blobs live under `objects/<first two hex digits>/<remaining hex digits>`.
//! Every write lands in `tmp/` under a unique name, is fsynced, and is then
//! renamed into place. A blob is therefore either absent or complete; two
//! concurrent puts of the same bytes both rename identical content onto the
//! same name.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs as afs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::StoreError;
use crate::logging::*;
use crate::types::ContentHash;
use crate::util::IO_BUFFER_SIZE;

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
	pub removed: usize,
	pub bytes_freed: u64,
	pub retained: usize,
}

/// On-disk content-addressed store
#[derive(Debug, Clone)]
pub struct ContentStore {
	root: PathBuf,
	max_blob_size: Option<u64>,
}

impl ContentStore {
	/// Open (creating if needed) a store rooted at `root`; stale temp files are removed
	pub async fn open(root: &Path) -> Result<Self, StoreError> {
		let store = ContentStore { root: root.to_path_buf(), max_blob_size: None };
		for dir in [store.objects_dir(), store.tmp_dir(), store.partial_dir()] {
			afs::create_dir_all(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
		}
		store.clear_dir(&store.tmp_dir()).await?;
		Ok(store)
	}

	pub fn with_max_blob_size(mut self, max: Option<u64>) -> Self {
		self.max_blob_size = max;
		self
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn objects_dir(&self) -> PathBuf {
		self.root.join("objects")
	}

	fn tmp_dir(&self) -> PathBuf {
		self.root.join("tmp")
	}

	/// Directory holding incomplete chunked uploads
	pub fn partial_dir(&self) -> PathBuf {
		self.root.join("partial")
	}

	fn object_path(&self, hash: &ContentHash) -> PathBuf {
		let hex = hash.to_hex();
		self.objects_dir().join(&hex[..2]).join(&hex[2..])
	}

	/// A fresh scratch path inside the store (same filesystem as the objects)
	pub fn temp_path(&self) -> PathBuf {
		self.tmp_dir().join(Uuid::new_v4().to_string())
	}

	/// Check a declared blob size against the configured limit
	pub fn check_size(&self, hash: &ContentHash, size: u64) -> Result<(), StoreError> {
		match self.max_blob_size {
			Some(max) if size > max => Err(StoreError::TooLarge { hash: *hash, size, max }),
			_ => Ok(()),
		}
	}

	pub async fn has(&self, hash: &ContentHash) -> bool {
		afs::metadata(self.object_path(hash)).await.map(|m| m.is_file()).unwrap_or(false)
	}

	/// Size of a stored blob
	pub async fn size(&self, hash: &ContentHash) -> Result<u64, StoreError> {
		let path = self.object_path(hash);
		match afs::metadata(&path).await {
			Ok(m) => Ok(m.len()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				Err(StoreError::NotFound { hash: *hash })
			}
			Err(e) => Err(StoreError::io(&path, e)),
		}
	}

	/// Store bytes, returning their hash. Idempotent.
	pub async fn put(&self, data: &[u8]) -> Result<ContentHash, StoreError> {
		let hash = ContentHash::of(data);
		self.check_size(&hash, data.len() as u64)?;
		if self.has(&hash).await {
			trace!("[store] {} already present", hash.short());
			return Ok(hash);
		}

		let tmp = self.temp_path();
		let result = async {
			let mut file = afs::File::create(&tmp).await?;
			file.write_all(data).await?;
			file.sync_all().await?;
			Ok::<(), io::Error>(())
		}
		.await;
		if let Err(e) = result {
			let _ = afs::remove_file(&tmp).await;
			return Err(StoreError::io(&tmp, e));
		}
		self.install(&tmp, &hash).await?;
		Ok(hash)
	}

	/// Stream a file into the store, hashing the bytes actually copied
	pub async fn put_file(&self, source: &Path) -> Result<(ContentHash, u64), StoreError> {
		let tmp = self.temp_path();
		let copied = copy_hashing(source, &tmp).await;
		let (hash, size) = match copied {
			Ok(v) => v,
			Err(e) => {
				let _ = afs::remove_file(&tmp).await;
				return Err(StoreError::io(source, e));
			}
		};
		if let Err(e) = self.check_size(&hash, size) {
			let _ = afs::remove_file(&tmp).await;
			return Err(e);
		}
		if self.has(&hash).await {
			let _ = afs::remove_file(&tmp).await;
		} else {
			self.install(&tmp, &hash).await?;
		}
		Ok((hash, size))
	}

	/// Verify a fully written scratch file against `expected` and move it into place.
	/// The scratch file is consumed either way.
	pub async fn commit_file(&self, scratch: &Path, expected: &ContentHash) -> Result<(), StoreError> {
		let actual = match crate::util::hash_file(scratch).await {
			Ok((h, _)) => h,
			Err(e) => {
				let _ = afs::remove_file(scratch).await;
				return Err(StoreError::io(scratch, e));
			}
		};
		if actual != *expected {
			let _ = afs::remove_file(scratch).await;
			return Err(StoreError::Integrity { expected: *expected, actual });
		}
		if self.has(expected).await {
			let _ = afs::remove_file(scratch).await;
			return Ok(());
		}
		self.install(scratch, expected).await
	}

	async fn install(&self, tmp: &Path, hash: &ContentHash) -> Result<(), StoreError> {
		let target = self.object_path(hash);
		if let Some(parent) = target.parent() {
			afs::create_dir_all(parent).await.map_err(|e| StoreError::io(parent, e))?;
		}
		if let Err(e) = afs::rename(tmp, &target).await {
			let _ = afs::remove_file(tmp).await;
			return Err(StoreError::io(&target, e));
		}
		debug!("[store] stored blob {}", hash.short());
		Ok(())
	}

	/// Read a whole blob
	pub async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
		let path = self.object_path(hash);
		match afs::read(&path).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				Err(StoreError::NotFound { hash: *hash })
			}
			Err(e) => Err(StoreError::io(&path, e)),
		}
	}

	/// Read at most `len` bytes of a blob starting at `offset`
	pub async fn read_range(
		&self,
		hash: &ContentHash,
		offset: u64,
		len: usize,
	) -> Result<Vec<u8>, StoreError> {
		let path = self.object_path(hash);
		let mut file = match afs::File::open(&path).await {
			Ok(f) => f,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(StoreError::NotFound { hash: *hash })
			}
			Err(e) => return Err(StoreError::io(&path, e)),
		};
		let size = file.metadata().await.map_err(|e| StoreError::io(&path, e))?.len();
		let available = size.saturating_sub(offset).min(len as u64) as usize;
		let mut buf = vec![0u8; available];
		if available > 0 {
			file.seek(io::SeekFrom::Start(offset)).await.map_err(|e| StoreError::io(&path, e))?;
			file.read_exact(&mut buf).await.map_err(|e| StoreError::io(&path, e))?;
		}
		Ok(buf)
	}

	/// Copy a blob to `dest`, re-verifying its digest on the way
	pub async fn export(&self, hash: &ContentHash, dest: &Path) -> Result<u64, StoreError> {
		let source = self.object_path(hash);
		if !self.has(hash).await {
			return Err(StoreError::NotFound { hash: *hash });
		}
		let (actual, size) = copy_hashing(&source, dest).await.map_err(|e| StoreError::io(dest, e))?;
		if actual != *hash {
			let _ = afs::remove_file(dest).await;
			warn!("[store] blob {} is corrupt on disk (hashes to {})", hash, actual);
			return Err(StoreError::Integrity { expected: *hash, actual });
		}
		Ok(size)
	}

	/// Remove a blob. Missing blobs are not an error.
	pub async fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError> {
		let path = self.object_path(hash);
		match afs::remove_file(&path).await {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(StoreError::io(&path, e)),
		}
	}

	/// All stored hashes, sorted
	pub async fn hashes(&self) -> Result<Vec<ContentHash>, StoreError> {
		let mut out = BTreeSet::new();
		let objects = self.objects_dir();
		let mut prefixes = afs::read_dir(&objects).await.map_err(|e| StoreError::io(&objects, e))?;
		while let Some(prefix) = prefixes.next_entry().await.map_err(|e| StoreError::io(&objects, e))? {
			let prefix_name = prefix.file_name().to_string_lossy().to_string();
			let mut blobs = match afs::read_dir(prefix.path()).await {
				Ok(rd) => rd,
				Err(e) => {
					warn!("[store] cannot read {}: {}", prefix.path().display(), e);
					continue;
				}
			};
			while let Some(blob) = blobs.next_entry().await.map_err(|e| StoreError::io(prefix.path(), e))? {
				let name = format!("{}{}", prefix_name, blob.file_name().to_string_lossy());
				match ContentHash::from_hex(&name) {
					Ok(h) => {
						out.insert(h);
					}
					Err(_) => debug!("[store] ignoring stray file {}", blob.path().display()),
				}
			}
		}
		Ok(out.into_iter().collect())
	}

	/// Number of stored blobs
	pub async fn count(&self) -> Result<usize, StoreError> {
		Ok(self.hashes().await?.len())
	}

	/// Remove every blob not in `reachable`
	pub async fn gc(&self, reachable: &BTreeSet<ContentHash>) -> Result<GcReport, StoreError> {
		let mut report = GcReport::default();
		for hash in self.hashes().await? {
			if reachable.contains(&hash) {
				report.retained += 1;
				continue;
			}
			let size = self.size(&hash).await.unwrap_or(0);
			if self.remove(&hash).await? {
				report.removed += 1;
				report.bytes_freed += size;
			}
		}
		info!(
			"[store] gc removed {} blobs ({} bytes), retained {}",
			report.removed, report.bytes_freed, report.retained
		);
		Ok(report)
	}

	async fn clear_dir(&self, dir: &Path) -> Result<(), StoreError> {
		let mut entries = afs::read_dir(dir).await.map_err(|e| StoreError::io(dir, e))?;
		while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(dir, e))? {
			let path = entry.path();
			match afs::remove_file(&path).await {
				Ok(()) => debug!("[store] removed stale temp file {}", path.display()),
				Err(e) if e.kind() == io::ErrorKind::NotFound => {}
				Err(e) => warn!("[store] cannot remove {}: {}", path.display(), e),
			}
		}
		Ok(())
	}

	/// Drop leftover partial uploads (their progress is tracked in memory only)
	pub async fn clear_partials(&self) -> Result<(), StoreError> {
		self.clear_dir(&self.partial_dir()).await
	}
}

/// Copy `source` to a new file at `dest` while hashing; the copy is fsynced
async fn copy_hashing(source: &Path, dest: &Path) -> io::Result<(ContentHash, u64)> {
	let mut input = afs::File::open(source).await?;
	let mut output = afs::File::create(dest).await?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; IO_BUFFER_SIZE];
	let mut total = 0u64;
	loop {
		let n = input.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		output.write_all(&buf[..n]).await?;
		total += n as u64;
	}
	output.sync_all().await?;
	Ok((hasher.finalize().into(), total))
}


// vim: ts=4
