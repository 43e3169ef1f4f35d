//! Manifest comparison
//!
//! `diff(A, B)` is a sorted merge over both manifests followed by a pass that
//! folds a delete and an add of the same content into a rename. Content
//! identity is kind + hash; differing mode or mtime alone is a metadata
//! update. Tombstones on either side count as absent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::cmp::Ordering;
use std::iter::Peekable;

use crate::manifest::Manifest;
use crate::types::{ContentHash, ContentState, Entry, EntryKind};

/// One operation of a change set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ChangeOp {
	Add { path: String, entry: Entry },
	Modify { path: String, entry: Entry },
	Delete { path: String },
	Rename { from: String, to: String, entry: Entry },
	MetadataUpdate { path: String, entry: Entry },
}

impl ChangeOp {
	/// Every path the operation touches (both ends of a rename)
	pub fn paths(&self) -> Vec<&str> {
		match self {
			ChangeOp::Add { path, .. }
			| ChangeOp::Modify { path, .. }
			| ChangeOp::Delete { path }
			| ChangeOp::MetadataUpdate { path, .. } => vec![path.as_str()],
			ChangeOp::Rename { from, to, .. } => vec![from.as_str(), to.as_str()],
		}
	}

	/// Entry the operation leaves at its destination
	pub fn entry(&self) -> Option<&Entry> {
		match self {
			ChangeOp::Add { entry, .. }
			| ChangeOp::Modify { entry, .. }
			| ChangeOp::Rename { entry, .. }
			| ChangeOp::MetadataUpdate { entry, .. } => Some(entry),
			ChangeOp::Delete { .. } => None,
		}
	}

	/// True if the operation writes new content (needs a blob staged)
	pub fn places_content(&self) -> bool {
		matches!(self, ChangeOp::Add { .. } | ChangeOp::Modify { .. } | ChangeOp::Rename { .. })
	}

	pub fn name(&self) -> &'static str {
		match self {
			ChangeOp::Add { .. } => "add",
			ChangeOp::Modify { .. } => "modify",
			ChangeOp::Delete { .. } => "delete",
			ChangeOp::Rename { .. } => "rename",
			ChangeOp::MetadataUpdate { .. } => "metadata-update",
		}
	}
}

/// Operation counts, recorded in commit history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
	pub added: usize,
	pub modified: usize,
	pub deleted: usize,
	pub renamed: usize,
	pub metadata_updated: usize,
}

/// Ordered list of operations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
	ops: Vec<ChangeOp>,
}

impl ChangeSet {
	pub fn new() -> Self {
		ChangeSet::default()
	}

	pub fn push(&mut self, op: ChangeOp) {
		self.ops.push(op);
	}

	pub fn ops(&self) -> &[ChangeOp] {
		&self.ops
	}

	pub fn iter(&self) -> std::slice::Iter<'_, ChangeOp> {
		self.ops.iter()
	}

	pub fn len(&self) -> usize {
		self.ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	/// Every path touched
	pub fn touched_paths(&self) -> BTreeSet<&str> {
		self.ops.iter().flat_map(ChangeOp::paths).collect()
	}

	/// Apply to a manifest in memory (tombstones of `base` are dropped)
	pub fn apply_to(&self, base: &Manifest) -> Manifest {
		let mut out = base.without_tombstones();
		for op in &self.ops {
			match op {
				ChangeOp::Add { path, entry }
				| ChangeOp::Modify { path, entry }
				| ChangeOp::MetadataUpdate { path, entry } => {
					out.insert(path.clone(), entry.clone());
				}
				ChangeOp::Delete { path } => {
					out.remove(path);
				}
				ChangeOp::Rename { from, to, entry } => {
					out.remove(from);
					out.insert(to.clone(), entry.clone());
				}
			}
		}
		out
	}

	pub fn counts(&self) -> ChangeCounts {
		let mut counts = ChangeCounts::default();
		for op in &self.ops {
			match op {
				ChangeOp::Add { .. } => counts.added += 1,
				ChangeOp::Modify { .. } => counts.modified += 1,
				ChangeOp::Delete { .. } => counts.deleted += 1,
				ChangeOp::Rename { .. } => counts.renamed += 1,
				ChangeOp::MetadataUpdate { .. } => counts.metadata_updated += 1,
			}
		}
		counts
	}
}

impl FromIterator<ChangeOp> for ChangeSet {
	fn from_iter<I: IntoIterator<Item = ChangeOp>>(iter: I) -> Self {
		ChangeSet { ops: iter.into_iter().collect() }
	}
}

impl<'a> IntoIterator for &'a ChangeSet {
	type Item = &'a ChangeOp;
	type IntoIter = std::slice::Iter<'a, ChangeOp>;

	fn into_iter(self) -> Self::IntoIter {
		self.ops.iter()
	}
}

/// Compute the change set turning `a` into `b`
///
/// Error entries in `b` produce no operation (nothing can be transferred for
/// them); in `a` they count as present with unknown content.
pub fn diff(a: &Manifest, b: &Manifest) -> ChangeSet {
	// Deletes remember the content they remove so the rename pass can match them
	let mut ops: Vec<(ChangeOp, ContentState)> = Vec::new();
	let mut left = live_entries(a);
	let mut right = live_entries(b);

	loop {
		let order = match (left.peek(), right.peek()) {
			(None, None) => break,
			(Some(_), None) => Ordering::Less,
			(None, Some(_)) => Ordering::Greater,
			(Some((pa, _)), Some((pb, _))) => pa.cmp(pb),
		};
		match order {
			Ordering::Less => {
				if let Some((path, old)) = left.next() {
					ops.push((ChangeOp::Delete { path: path.clone() }, old.content()));
				}
			}
			Ordering::Greater => {
				if let Some((path, entry)) = right.next() {
					if entry.kind != EntryKind::Error {
						let op = ChangeOp::Add { path: path.clone(), entry: entry.clone() };
						ops.push((op, entry.content()));
					}
				}
			}
			Ordering::Equal => {
				if let (Some((path, old)), Some((_, new))) = (left.next(), right.next()) {
					if let Some(op) = compare(path, old, new) {
						ops.push((op, new.content()));
					}
				}
			}
		}
	}

	ChangeSet { ops: fold_renames(ops) }
}

fn live_entries(m: &Manifest) -> Peekable<impl Iterator<Item = (&String, &Entry)>> {
	m.iter().filter(|(_, e)| e.kind != EntryKind::Deleted).peekable()
}

fn compare(path: &str, old: &Entry, new: &Entry) -> Option<ChangeOp> {
	if new.kind == EntryKind::Error {
		return None;
	}
	if old.content() != new.content() {
		Some(ChangeOp::Modify { path: path.to_string(), entry: new.clone() })
	} else if !old.same_metadata(new) {
		Some(ChangeOp::MetadataUpdate { path: path.to_string(), entry: new.clone() })
	} else {
		None
	}
}

/// Identity key for rename matching: (is symlink, hash)
fn identity(state: &ContentState) -> Option<(bool, ContentHash)> {
	match state {
		ContentState::Present(kind, hash) => Some((*kind == EntryKind::Symlink, *hash)),
		_ => None,
	}
}

/// Pair deletes with adds of identical content. Deletes claim adds in path
/// order; each claimed add becomes a rename at the add's position.
fn fold_renames(ops: Vec<(ChangeOp, ContentState)>) -> Vec<ChangeOp> {
	let mut adds: BTreeMap<(bool, ContentHash), VecDeque<usize>> = BTreeMap::new();
	for (idx, (op, state)) in ops.iter().enumerate() {
		if let (ChangeOp::Add { .. }, Some(key)) = (op, identity(state)) {
			adds.entry(key).or_default().push_back(idx);
		}
	}

	// add index -> source path of the delete that claimed it
	let mut renamed_from: BTreeMap<usize, String> = BTreeMap::new();
	let mut folded_deletes: BTreeSet<usize> = BTreeSet::new();
	if !adds.is_empty() {
		for (idx, (op, state)) in ops.iter().enumerate() {
			let (ChangeOp::Delete { path }, Some(key)) = (op, identity(state)) else {
				continue;
			};
			if let Some(add_idx) = adds.get_mut(&key).and_then(VecDeque::pop_front) {
				renamed_from.insert(add_idx, path.clone());
				folded_deletes.insert(idx);
			}
		}
	}

	ops.into_iter()
		.enumerate()
		.filter(|(idx, _)| !folded_deletes.contains(idx))
		.map(|(idx, (op, _))| match (op, renamed_from.remove(&idx)) {
			(ChangeOp::Add { path, entry }, Some(from)) => ChangeOp::Rename { from, to: path, entry },
			(op, _) => op,
		})
		.collect()
}


// vim: ts=4
