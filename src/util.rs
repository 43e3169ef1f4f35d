//! Hashing and time helpers

use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

use crate::types::ContentHash;

/// Read buffer used when hashing or copying blobs
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Hash everything a reader yields without buffering it whole
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(ContentHash, u64)> {
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; IO_BUFFER_SIZE];
	let mut total = 0u64;
	loop {
		let n = match reader.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		};
		hasher.update(&buf[..n]);
		total += n as u64;
	}
	Ok((hasher.finalize().into(), total))
}

/// Async variant of [`hash_reader`] for a file on disk
pub async fn hash_file(path: &Path) -> io::Result<(ContentHash, u64)> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; IO_BUFFER_SIZE];
	let mut total = 0u64;
	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		total += n as u64;
	}
	Ok((hasher.finalize().into(), total))
}

/// Seconds since the epoch
pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Convert seconds since the epoch into a `SystemTime`
pub fn system_time(secs: i64) -> SystemTime {
	if secs >= 0 {
		UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
	} else {
		UNIX_EPOCH - std::time::Duration::from_secs(secs.unsigned_abs())
	}
}


// vim: ts=4
