//! Core value types: content hashes and manifest entries

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Permission bits recorded for symlinks (their own mode is not meaningful)
pub const SYMLINK_MODE: u32 = 0o777;

/// BLAKE3 digest of a blob's raw bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
	/// Hash a byte slice
	pub fn of(data: &[u8]) -> Self {
		ContentHash(*blake3::hash(data).as_bytes())
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Result<Self, String> {
		let bytes = hex::decode(s).map_err(|e| format!("Invalid content hash {:?}: {}", s, e))?;
		let arr: [u8; 32] = bytes
			.try_into()
			.map_err(|_| format!("Invalid content hash {:?}: expected 32 bytes", s))?;
		Ok(ContentHash(arr))
	}

	/// Short form used in log lines
	pub fn short(&self) -> String {
		hex::encode(&self.0[..6])
	}
}

impl From<blake3::Hash> for ContentHash {
	fn from(h: blake3::Hash) -> Self {
		ContentHash(*h.as_bytes())
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContentHash({})", self.short())
	}
}

impl FromStr for ContentHash {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ContentHash::from_hex(s)
	}
}

impl Serialize for ContentHash {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for ContentHash {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		ContentHash::from_hex(&s).map_err(de::Error::custom)
	}
}

/// Kind of a manifest entry
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
	File,
	Symlink,
	/// Tombstone: removed since the baseline
	Deleted,
	/// Path exists but could not be read
	Error,
}

impl fmt::Display for EntryKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EntryKind::File => write!(f, "file"),
			EntryKind::Symlink => write!(f, "symlink"),
			EntryKind::Deleted => write!(f, "deleted"),
			EntryKind::Error => write!(f, "error"),
		}
	}
}

/// One path's state in a manifest
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Entry {
	pub kind: EntryKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hash: Option<ContentHash>,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub mode: u32,
	/// Modification time, seconds since the epoch
	#[serde(default)]
	pub mtime: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Entry {
	pub fn file(hash: ContentHash, size: u64, mode: u32, mtime: i64) -> Self {
		Entry { kind: EntryKind::File, hash: Some(hash), size, mode: mode & 0o7777, mtime, error: None }
	}

	/// Symlink whose content is the target string
	pub fn symlink(target: &str) -> Self {
		Entry {
			kind: EntryKind::Symlink,
			hash: Some(ContentHash::of(target.as_bytes())),
			size: target.len() as u64,
			mode: SYMLINK_MODE,
			mtime: 0,
			error: None,
		}
	}

	pub fn deleted() -> Self {
		Entry { kind: EntryKind::Deleted, hash: None, size: 0, mode: 0, mtime: 0, error: None }
	}

	pub fn unreadable(message: impl Into<String>) -> Self {
		Entry {
			kind: EntryKind::Error,
			hash: None,
			size: 0,
			mode: 0,
			mtime: 0,
			error: Some(message.into()),
		}
	}

	/// File or symlink (something with content)
	pub fn is_present(&self) -> bool {
		matches!(self.kind, EntryKind::File | EntryKind::Symlink)
	}

	pub fn content(&self) -> ContentState {
		match (self.kind, self.hash) {
			(EntryKind::File, Some(h)) | (EntryKind::Symlink, Some(h)) => {
				ContentState::Present(self.kind, h)
			}
			(EntryKind::Error, _) => ContentState::Unreadable,
			_ => ContentState::Absent,
		}
	}

	/// Same permission bits and mtime
	pub fn same_metadata(&self, other: &Entry) -> bool {
		self.mode == other.mode && self.mtime == other.mtime
	}

	/// Keep only permission bits; peers may send a full `st_mode`
	pub fn normalize(&mut self) {
		self.mode = match self.kind {
			EntryKind::File => self.mode & 0o7777,
			EntryKind::Symlink => SYMLINK_MODE,
			EntryKind::Deleted | EntryKind::Error => 0,
		};
	}

	/// Check internal consistency of an entry received from a peer
	pub fn check(&self) -> Result<(), String> {
		match self.kind {
			EntryKind::File | EntryKind::Symlink if self.hash.is_none() => {
				Err(format!("{} entry without content hash", self.kind))
			}
			EntryKind::Deleted if self.hash.is_some() => {
				Err("deleted entry carries a content hash".to_string())
			}
			_ => Ok(()),
		}
	}
}

/// Content identity of a path, used for diffing and conflict checks
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContentState {
	Absent,
	Present(EntryKind, ContentHash),
	Unreadable,
}

impl ContentState {
	pub fn of(entry: Option<&Entry>) -> Self {
		entry.map(Entry::content).unwrap_or(ContentState::Absent)
	}

	pub fn hash(&self) -> Option<ContentHash> {
		match self {
			ContentState::Present(_, h) => Some(*h),
			_ => None,
		}
	}
}


// vim: ts=4
