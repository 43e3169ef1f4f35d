//! Manifests: the path -> entry map of a tree, and the builder that scans one
//!
//! Directories are implicit. Only files and symlinks appear (plus tombstones
//! and error entries), so empty directories are not represented. The map is
//! ordered, which makes the JSON form of an unchanged tree byte-identical
//! across builds.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::logging::*;
use crate::state::{FileStamp, StateDb};
use crate::types::{ContentHash, ContentState, Entry, EntryKind};
use crate::util;
use crate::validation::{self, SEPARATOR};

/// Ordered mapping path -> entry
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Manifest {
	entries: BTreeMap<String, Entry>,
}

impl Manifest {
	pub fn new() -> Self {
		Manifest::default()
	}

	/// Build from entries received from a peer, validating every path
	pub fn from_entries(entries: BTreeMap<String, Entry>) -> Result<Self, SyncError> {
		Manifest { entries }.checked()
	}

	/// Normalize entry modes and validate; every manifest a peer hands in
	/// goes through here
	pub fn checked(mut self) -> Result<Self, SyncError> {
		for entry in self.entries.values_mut() {
			entry.normalize();
		}
		self.validate()?;
		Ok(self)
	}

	/// Parse the JSON form
	pub fn from_json(bytes: &[u8]) -> Result<Self, SyncError> {
		serde_json::from_slice(bytes)
			.map_err(|e| SyncError::protocol(format!("Invalid manifest: {}", e)))
	}

	/// Deterministic JSON form (sorted by path)
	pub fn to_json(&self) -> Result<Vec<u8>, SyncError> {
		serde_json::to_vec(&self.entries)
			.map_err(|e| SyncError::protocol(format!("Cannot encode manifest: {}", e)))
	}

	/// Check paths are canonical, entries are consistent, and no present
	/// entry sits below another present entry (a path cannot be both a file
	/// and a directory)
	pub fn validate(&self) -> Result<(), SyncError> {
		for (path, entry) in &self.entries {
			let normalized = validation::normalize_path(path)
				.map_err(|e| SyncError::protocol_at(e.to_string(), path.as_str()))?;
			if normalized != *path {
				return Err(SyncError::protocol_at(
					format!("Path {:?} is not in canonical form ({:?})", path, normalized),
					path.as_str(),
				));
			}
			entry.check().map_err(|e| SyncError::protocol_at(e, path.as_str()))?;
			if entry.is_present() {
				if let Some(ancestor) = self.present_ancestor(path) {
					return Err(SyncError::Protocol {
						message: format!("{:?} lies below the file {:?}", path, ancestor),
						paths: vec![path.clone(), ancestor.to_string()],
					});
				}
			}
		}
		Ok(())
	}

	pub fn get(&self, path: &str) -> Option<&Entry> {
		self.entries.get(path)
	}

	/// Content identity at `path` (tombstones and missing paths are absent)
	pub fn content(&self, path: &str) -> ContentState {
		ContentState::of(self.entries.get(path))
	}

	/// Insert without validation (builders and the applier)
	pub fn insert(&mut self, path: impl Into<String>, entry: Entry) -> Option<Entry> {
		self.entries.insert(path.into(), entry)
	}

	pub fn remove(&mut self, path: &str) -> Option<Entry> {
		self.entries.remove(path)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn entries(&self) -> &BTreeMap<String, Entry> {
		&self.entries
	}

	/// Hashes of every file and symlink
	pub fn hashes(&self) -> BTreeSet<ContentHash> {
		self.entries.values().filter(|e| e.is_present()).filter_map(|e| e.hash).collect()
	}

	/// Paths of error entries
	pub fn errors(&self) -> impl Iterator<Item = (&String, &Entry)> {
		self.entries.iter().filter(|(_, e)| e.kind == EntryKind::Error)
	}

	/// Same manifest with tombstones dropped
	pub fn without_tombstones(&self) -> Manifest {
		Manifest {
			entries: self
				.entries
				.iter()
				.filter(|(_, e)| e.kind != EntryKind::Deleted)
				.map(|(p, e)| (p.clone(), e.clone()))
				.collect(),
		}
	}

	/// Closest ancestor of `path` that holds a file, symlink or error entry
	pub fn present_ancestor<'a>(&self, path: &'a str) -> Option<&'a str> {
		validation::ancestors(path).find(|a| {
			self.entries.get(*a).is_some_and(|e| e.is_present() || e.kind == EntryKind::Error)
		})
	}

	/// Non-tombstone entries strictly below `dir`
	pub fn descendants<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
		// '0' is the character after '/', so the range covers exactly "dir/..."
		let start = format!("{}{}", dir, SEPARATOR);
		let end = format!("{}0", dir);
		self.entries.range(start..end).filter(|(_, e)| e.kind != EntryKind::Deleted)
	}
}

impl Serialize for Manifest {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		self.entries.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Manifest {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let entries = BTreeMap::<String, Entry>::deserialize(deserializer)?;
		Manifest::from_entries(entries).map_err(de::Error::custom)
	}
}

impl FromIterator<(String, Entry)> for Manifest {
	fn from_iter<I: IntoIterator<Item = (String, Entry)>>(iter: I) -> Self {
		Manifest { entries: iter.into_iter().collect() }
	}
}

/// Scans a directory tree into a [`Manifest`]
///
/// The build never fails because of a single path: unreadable files and
/// directories, and names that are not valid UTF-8, become error entries.
/// Only a missing or unreadable root is an error.
pub struct ManifestBuilder {
	root: PathBuf,
	exclusion: Option<Arc<ExclusionEngine>>,
	cache: Option<Arc<StateDb>>,
}

/// Per-build bookkeeping
#[derive(Default)]
struct Scan {
	manifest: Manifest,
	fresh: Vec<(String, FileStamp, ContentHash)>,
	cache_hits: usize,
}

impl ManifestBuilder {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		ManifestBuilder { root: root.into(), exclusion: None, cache: None }
	}

	pub fn with_exclusion(mut self, exclusion: Arc<ExclusionEngine>) -> Self {
		self.exclusion = Some(exclusion);
		self
	}

	/// Enable the fast path: reuse hashes of files whose stamp is unchanged
	pub fn with_cache(mut self, cache: Arc<StateDb>) -> Self {
		self.cache = Some(cache);
		self
	}

	/// Scan the tree (blocking)
	pub fn build(&self) -> Result<Manifest, SyncError> {
		let root_meta = fs::metadata(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
		if !root_meta.is_dir() {
			return Err(SyncError::io(
				&self.root,
				std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
			));
		}
		let top = fs::read_dir(&self.root).map_err(|e| SyncError::io(&self.root, e))?;

		let mut scan = Scan::default();
		self.scan_entries(top, "", &mut scan);

		if let Some(cache) = &self.cache {
			self.update_cache(cache, &scan);
		}
		debug!(
			"Built manifest of {} with {} entries ({} cached hashes)",
			self.root.display(),
			scan.manifest.len(),
			scan.cache_hits
		);
		Ok(scan.manifest)
	}

	/// Scan the tree on the blocking thread pool
	pub async fn build_async(self) -> Result<Manifest, SyncError> {
		let root = self.root.clone();
		tokio::task::spawn_blocking(move || self.build()).await.map_err(|e| {
			SyncError::io(root, std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
		})?
	}

	fn scan_dir(&self, dir: &Path, prefix: &str, scan: &mut Scan) {
		match fs::read_dir(dir) {
			Ok(entries) => self.scan_entries(entries, prefix, scan),
			Err(e) => {
				warn!("Cannot read directory {}: {}", dir.display(), e);
				scan.manifest.insert(prefix, Entry::unreadable(e.to_string()));
			}
		}
	}

	fn scan_entries(&self, entries: fs::ReadDir, prefix: &str, scan: &mut Scan) {
		for entry_result in entries {
			let entry = match entry_result {
				Ok(e) => e,
				Err(e) => {
					debug!("Error reading directory entry below {:?}: {}", prefix, e);
					continue;
				}
			};

			let fs_path = entry.path();
			let file_name = entry.file_name();
			let (name, name_error) = match file_name.to_str() {
				Some(name) if name.contains('\\') => {
					(name.to_string(), Some("file name contains a backslash"))
				}
				Some(name) => (name.to_string(), None),
				None => (file_name.to_string_lossy().into_owned(), Some("file name is not valid UTF-8")),
			};
			let path = if prefix.is_empty() { name } else { format!("{}/{}", prefix, name) };

			let meta = match fs::symlink_metadata(&fs_path) {
				Ok(m) => m,
				Err(e) => {
					warn!("Cannot access {}: {}", fs_path.display(), e);
					if !self.is_excluded(&path, false) {
						scan.manifest.insert(path, Entry::unreadable(e.to_string()));
					}
					continue;
				}
			};

			if self.is_excluded(&path, meta.is_dir()) {
				continue;
			}
			if let Some(reason) = name_error {
				warn!("Skipping {}: {}", fs_path.display(), reason);
				scan.manifest.insert(path, Entry::unreadable(reason));
				continue;
			}

			if meta.is_dir() {
				self.scan_dir(&fs_path, &path, scan);
			} else if meta.is_symlink() {
				let entry = match fs::read_link(&fs_path) {
					Ok(target) => match target.to_str() {
						Some(t) => Entry::symlink(t),
						None => Entry::unreadable("symlink target is not valid UTF-8"),
					},
					Err(e) => {
						warn!("Cannot read symlink {}: {}", fs_path.display(), e);
						Entry::unreadable(e.to_string())
					}
				};
				scan.manifest.insert(path, entry);
			} else if meta.is_file() {
				let entry = self.file_entry(&fs_path, &path, &meta, scan);
				scan.manifest.insert(path, entry);
			} else {
				trace!("Skipping special file {}", fs_path.display());
			}
		}
	}

	fn file_entry(&self, fs_path: &Path, path: &str, meta: &fs::Metadata, scan: &mut Scan) -> Entry {
		let stamp = FileStamp::from_metadata(meta);
		if let Some(cache) = &self.cache {
			match cache.cached_hash(path, &stamp) {
				Ok(Some(hash)) => {
					scan.cache_hits += 1;
					return Entry::file(hash, meta.size(), meta.mode(), meta.mtime());
				}
				Ok(None) => {}
				Err(e) => warn!("Hash cache lookup failed for {}: {}", path, e),
			}
		}

		match fs::File::open(fs_path).and_then(util::hash_reader) {
			Ok((hash, size)) => {
				scan.fresh.push((path.to_string(), stamp, hash));
				Entry::file(hash, size, meta.mode(), meta.mtime())
			}
			Err(e) => {
				warn!("Cannot read file {}: {}", fs_path.display(), e);
				Entry::unreadable(e.to_string())
			}
		}
	}

	fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
		match &self.exclusion {
			Some(engine) if is_dir => engine.should_exclude_dir(path),
			Some(engine) => engine.should_exclude(path),
			None => false,
		}
	}

	/// The cache is advisory; failures are logged, never returned
	fn update_cache(&self, cache: &StateDb, scan: &Scan) {
		let now = util::unix_now() as i64;
		if let Err(e) = cache.update_hashes(&scan.fresh, now) {
			warn!("Cannot update hash cache: {}", e);
		}
		let live: BTreeSet<String> = scan
			.manifest
			.iter()
			.filter(|(_, e)| e.kind == EntryKind::File)
			.map(|(p, _)| p.clone())
			.collect();
		if let Err(e) = cache.prune_hashes(&live) {
			warn!("Cannot prune hash cache: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::fs::{symlink, PermissionsExt};

	fn write(root: &Path, path: &str, data: &[u8]) {
		let full = root.join(path);
		fs::create_dir_all(full.parent().unwrap()).unwrap();
		fs::write(full, data).unwrap();
	}

	#[test]
	fn test_build_files_and_symlinks() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"alpha");
		write(dir.path(), "sub/deep/b.txt", b"beta");
		fs::create_dir_all(dir.path().join("empty")).unwrap();
		symlink("a.txt", dir.path().join("link")).unwrap();

		let manifest = ManifestBuilder::new(dir.path()).build().unwrap();
		let paths: Vec<&String> = manifest.iter().map(|(p, _)| p).collect();
		assert_eq!(paths, vec!["a.txt", "link", "sub/deep/b.txt"]);

		let a = manifest.get("a.txt").unwrap();
		assert_eq!(a.kind, EntryKind::File);
		assert_eq!(a.hash, Some(ContentHash::of(b"alpha")));
		assert_eq!(a.size, 5);

		let link = manifest.get("link").unwrap();
		assert_eq!(link.kind, EntryKind::Symlink);
		assert_eq!(link.hash, Some(ContentHash::of(b"a.txt")));
	}

	#[test]
	fn test_build_is_deterministic() {
		let dir = tempfile::tempdir().unwrap();
		for i in 0..20 {
			write(dir.path(), &format!("d{}/f{}.txt", i % 3, i), format!("{}", i).as_bytes());
		}
		let first = ManifestBuilder::new(dir.path()).build().unwrap();
		let second = ManifestBuilder::new(dir.path()).build().unwrap();
		assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
	}

	#[test]
	fn test_build_excludes_reserved() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "keep.txt", b"k");
		write(dir.path(), ".reposync/objects/xx", b"blob");
		let engine = Arc::new(ExclusionEngine::reserved_only(".reposync").unwrap());
		let manifest = ManifestBuilder::new(dir.path()).with_exclusion(engine).build().unwrap();
		assert_eq!(manifest.len(), 1);
		assert!(manifest.get("keep.txt").is_some());
	}

	#[test]
	fn test_unreadable_file_becomes_error_entry() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "secret", b"s");
		write(dir.path(), "open", b"o");
		let secret = dir.path().join("secret");
		fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();

		let manifest = ManifestBuilder::new(dir.path()).build().unwrap();
		// root can read anything; only assert when the permission bit took effect
		if fs::File::open(&secret).is_err() {
			assert_eq!(manifest.get("secret").unwrap().kind, EntryKind::Error);
			assert_eq!(manifest.errors().count(), 1);
		}
		assert_eq!(manifest.get("open").unwrap().kind, EntryKind::File);
	}

	#[test]
	fn test_missing_root_is_error() {
		let dir = tempfile::tempdir().unwrap();
		let err = ManifestBuilder::new(dir.path().join("nope")).build().unwrap_err();
		assert_eq!(err.kind(), "io");
	}

	#[test]
	fn test_fast_path_reuses_cached_hash() {
		let dir = tempfile::tempdir().unwrap();
		let tree = dir.path().join("tree");
		write(&tree, "a.txt", b"original");
		let old = filetime::FileTime::from_unix_time(1_600_000_000, 0);
		filetime::set_file_mtime(tree.join("a.txt"), old).unwrap();

		let cache = Arc::new(StateDb::open(&dir.path().join("state.redb")).unwrap());
		let first = ManifestBuilder::new(&tree).with_cache(cache.clone()).build().unwrap();
		let stamp = FileStamp::from_metadata(&fs::metadata(tree.join("a.txt")).unwrap());
		assert_eq!(
			cache.cached_hash("a.txt", &stamp).unwrap(),
			Some(ContentHash::of(b"original"))
		);

		let second = ManifestBuilder::new(&tree).with_cache(cache.clone()).build().unwrap();
		assert_eq!(first, second);

		// Same size and mtime, new content: ctime moves, so the file is re-hashed
		fs::write(tree.join("a.txt"), b"modified").unwrap();
		filetime::set_file_mtime(tree.join("a.txt"), old).unwrap();
		let third = ManifestBuilder::new(&tree).with_cache(cache).build().unwrap();
		assert_eq!(third.get("a.txt").unwrap().hash, Some(ContentHash::of(b"modified")));
	}

	#[test]
	fn test_deserialize_rejects_bad_paths() {
		let h = ContentHash::of(b"x").to_hex();
		let bad = format!(r#"{{"../etc/passwd": {{"kind": "file", "hash": "{}"}}}}"#, h);
		assert!(Manifest::from_json(bad.as_bytes()).is_err());

		let noncanonical = format!(r#"{{"a//b": {{"kind": "file", "hash": "{}"}}}}"#, h);
		assert!(Manifest::from_json(noncanonical.as_bytes()).is_err());

		let nested = format!(
			r#"{{"a": {{"kind": "file", "hash": "{h}"}}, "a/b": {{"kind": "file", "hash": "{h}"}}}}"#,
			h = h
		);
		assert!(Manifest::from_json(nested.as_bytes()).is_err());

		let ok = format!(r#"{{"a/b": {{"kind": "file", "hash": "{}", "size": 1}}}}"#, h);
		assert!(Manifest::from_json(ok.as_bytes()).is_ok());
	}

	#[test]
	fn test_descendants_range() {
		let h = ContentHash::of(b"x");
		let manifest: Manifest = [
			("a".to_string(), Entry::deleted()),
			("a/x".to_string(), Entry::file(h, 1, 0o644, 0)),
			("a/y".to_string(), Entry::deleted()),
			("a.txt".to_string(), Entry::file(h, 1, 0o644, 0)),
			("ab/z".to_string(), Entry::file(h, 1, 0o644, 0)),
		]
		.into_iter()
		.collect();
		let below: Vec<&String> = manifest.descendants("a").map(|(p, _)| p).collect();
		assert_eq!(below, vec!["a/x"]);
	}
}

// vim: ts=4
