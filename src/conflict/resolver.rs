//! Per-path conflict resolution

use std::collections::BTreeSet;

use super::{Conflict, ConflictType};
use crate::diff::{self, ChangeOp, ChangeSet};
use crate::error::SyncError;
use crate::manifest::Manifest;
use crate::types::{ContentState, Entry, EntryKind};
use crate::validation;

/// Outcome of checking a change set against the live manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
	/// Operations that may be applied to the live tree
	pub changes: ChangeSet,

	/// Rejected paths
	pub conflicts: Vec<Conflict>,

	/// Paths skipped because the live tree already holds the client's target
	pub converged: Vec<String>,
}

impl Resolution {
	pub fn is_clean(&self) -> bool {
		self.conflicts.is_empty()
	}
}

/// One side of an operation, checked on its own path
#[derive(Debug, Clone)]
enum Half {
	Remove { path: String },
	/// `modify` replaces content the baseline already had at the path
	Place { path: String, entry: Entry, modify: bool },
	Metadata { path: String, entry: Entry },
}

impl Half {
	fn path(&self) -> &str {
		match self {
			Half::Remove { path } | Half::Place { path, .. } | Half::Metadata { path, .. } => path,
		}
	}

	fn entry(&self) -> Option<&Entry> {
		match self {
			Half::Remove { .. } => None,
			Half::Place { entry, .. } | Half::Metadata { entry, .. } => Some(entry),
		}
	}

	fn wanted(&self) -> ContentState {
		ContentState::of(self.entry())
	}

	fn into_op(self) -> ChangeOp {
		match self {
			Half::Remove { path } => ChangeOp::Delete { path },
			Half::Place { path, entry, modify: true } => ChangeOp::Modify { path, entry },
			Half::Place { path, entry, modify: false } => ChangeOp::Add { path, entry },
			Half::Metadata { path, entry } => ChangeOp::MetadataUpdate { path, entry },
		}
	}
}

#[derive(Debug, Clone)]
enum Verdict {
	Clean,
	/// Live already matches the target content
	Converged,
	/// Live matches the target content but not its metadata
	Reduced(Entry),
	Conflict(Conflict),
}

/// Checks change sets against a repository's live manifest
#[derive(Debug, Clone)]
pub struct ConflictResolver {
	reserved: String,
}

impl ConflictResolver {
	/// `reserved` is the repository's data directory name; no change may touch it
	pub fn new(reserved: impl Into<String>) -> Self {
		ConflictResolver { reserved: reserved.into() }
	}

	/// Reject targets that cannot be applied regardless of live state
	pub fn check_target(&self, target: &Manifest) -> Result<(), SyncError> {
		let errors: Vec<String> = target.errors().map(|(p, _)| p.clone()).collect();
		if !errors.is_empty() {
			return Err(SyncError::Protocol {
				message: "Target manifest contains unreadable entries".to_string(),
				paths: errors,
			});
		}
		Ok(())
	}

	/// Classify every path touched by `diff(baseline, target)` against `live`
	pub fn resolve(
		&self,
		baseline: &Manifest,
		target: &Manifest,
		live: &Manifest,
	) -> Result<Resolution, SyncError> {
		self.check_target(target)?;
		let changes = diff::diff(baseline, target);

		let reserved: Vec<String> = changes
			.touched_paths()
			.into_iter()
			.filter(|p| validation::is_reserved(p, &self.reserved))
			.map(String::from)
			.collect();
		if !reserved.is_empty() {
			return Err(SyncError::Protocol {
				message: format!("Paths below {:?} are reserved", self.reserved),
				paths: reserved,
			});
		}

		// Split every op into halves and judge each on its own path
		let mut ops: Vec<(bool, Vec<(Half, Verdict)>)> = Vec::with_capacity(changes.len());
		for op in changes.iter() {
			let is_rename = matches!(op, ChangeOp::Rename { .. });
			let halves = split(op)
				.into_iter()
				.map(|half| {
					let verdict = check_half(&half, baseline, live);
					(half, verdict)
				})
				.collect();
			ops.push((is_rename, halves));
		}

		// Placements may depend on removals elsewhere in the set
		let removed: BTreeSet<String> = ops
			.iter()
			.flat_map(|(_, halves)| halves.iter())
			.filter(|(half, verdict)| matches!(half, Half::Remove { .. }) && matches!(verdict, Verdict::Clean))
			.map(|(half, _)| half.path().to_string())
			.collect();
		for (_, halves) in ops.iter_mut() {
			for (half, verdict) in halves.iter_mut() {
				if matches!(half, Half::Place { .. }) && matches!(verdict, Verdict::Clean) {
					if let Some(conflict) = structural_conflict(half, baseline, live, &removed) {
						*verdict = Verdict::Conflict(conflict);
					}
				}
			}
		}

		let mut resolution = Resolution::default();
		for (is_rename, halves) in ops {
			let all_clean = halves.iter().all(|(_, v)| matches!(v, Verdict::Clean));
			if is_rename && all_clean {
				if let [(Half::Remove { path: from }, _), (Half::Place { path: to, entry, .. }, _)] = &halves[..] {
					resolution.changes.push(ChangeOp::Rename {
						from: from.clone(),
						to: to.clone(),
						entry: entry.clone(),
					});
					continue;
				}
			}
			for (half, verdict) in halves {
				match verdict {
					Verdict::Clean => resolution.changes.push(half.into_op()),
					Verdict::Reduced(entry) => resolution.changes.push(ChangeOp::MetadataUpdate {
						path: half.path().to_string(),
						entry,
					}),
					Verdict::Converged => resolution.converged.push(half.path().to_string()),
					Verdict::Conflict(conflict) => resolution.conflicts.push(conflict),
				}
			}
		}
		Ok(resolution)
	}

	/// Resolve again under the commit lock
	///
	/// Fails with every conflict on a path `previous` accepted. Otherwise
	/// returns the operations to apply now, limited to paths `previous`
	/// accepted (nothing else was staged).
	pub fn recheck(
		&self,
		previous: &Resolution,
		baseline: &Manifest,
		target: &Manifest,
		live: &Manifest,
	) -> Result<Resolution, SyncError> {
		let current = self.resolve(baseline, target, live)?;
		let accepted: BTreeSet<&str> = previous.changes.touched_paths();

		let newly: Vec<Conflict> = current
			.conflicts
			.iter()
			.filter(|c| accepted.contains(c.path.as_str()))
			.cloned()
			.collect();
		if !newly.is_empty() {
			return Err(SyncError::Conflict { conflicts: newly });
		}

		// A placement nobody staged means live moved away from content it held at planning
		let staged: BTreeSet<&str> = previous
			.changes
			.iter()
			.filter_map(|op| match op {
				ChangeOp::Add { path, .. } | ChangeOp::Modify { path, .. } => Some(path.as_str()),
				ChangeOp::Rename { to, .. } => Some(to.as_str()),
				_ => None,
			})
			.collect();
		let unstaged: Vec<Conflict> = current
			.changes
			.iter()
			.filter_map(|op| match op {
				ChangeOp::Add { path, entry } | ChangeOp::Modify { path, entry } => Some((path, entry)),
				ChangeOp::Rename { to, entry, .. } => Some((to, entry)),
				_ => None,
			})
			.filter(|(path, _)| accepted.contains(path.as_str()) && !staged.contains(path.as_str()))
			.map(|(path, entry)| {
				let base = baseline.content(path);
				let server = live.content(path);
				let wanted = entry.content();
				Conflict::new(path.as_str(), ConflictType::classify(base, server, wanted), base, server, wanted)
			})
			.collect();
		if !unstaged.is_empty() {
			return Err(SyncError::Conflict { conflicts: unstaged });
		}

		let mut changes = ChangeSet::new();
		for op in current.changes.iter() {
			if op.paths().iter().all(|p| accepted.contains(p)) {
				changes.push(op.clone());
			} else if let ChangeOp::Rename { from, to, entry } = op {
				if accepted.contains(from.as_str()) {
					changes.push(ChangeOp::Delete { path: from.clone() });
				}
				if accepted.contains(to.as_str()) {
					changes.push(ChangeOp::Add { path: to.clone(), entry: entry.clone() });
				}
			}
		}
		Ok(Resolution { changes, conflicts: previous.conflicts.clone(), converged: current.converged })
	}
}

fn split(op: &ChangeOp) -> Vec<Half> {
	match op {
		ChangeOp::Add { path, entry } => {
			vec![Half::Place { path: path.clone(), entry: entry.clone(), modify: false }]
		}
		ChangeOp::Modify { path, entry } => {
			vec![Half::Place { path: path.clone(), entry: entry.clone(), modify: true }]
		}
		ChangeOp::MetadataUpdate { path, entry } => {
			vec![Half::Metadata { path: path.clone(), entry: entry.clone() }]
		}
		ChangeOp::Delete { path } => vec![Half::Remove { path: path.clone() }],
		ChangeOp::Rename { from, to, entry } => vec![
			Half::Remove { path: from.clone() },
			Half::Place { path: to.clone(), entry: entry.clone(), modify: false },
		],
	}
}

fn check_half(half: &Half, baseline: &Manifest, live: &Manifest) -> Verdict {
	let path = half.path();
	let base = baseline.content(path);
	let server = live.content(path);
	let wanted = half.wanted();

	if server == ContentState::Unreadable {
		return Verdict::Conflict(Conflict::new(path, ConflictType::Unreadable, base, server, wanted));
	}
	if server == base {
		return Verdict::Clean;
	}
	if server == wanted {
		return match (half.entry(), live.get(path)) {
			(Some(want), Some(have)) if !want.same_metadata(have) => Verdict::Reduced(want.clone()),
			_ => Verdict::Converged,
		};
	}
	let kind = ConflictType::classify(base, server, wanted);
	Verdict::Conflict(Conflict::new(path, kind, base, server, wanted))
}

/// A placement that creates a path must not land below a live file, nor on
/// top of live entries that stay
fn structural_conflict(
	half: &Half,
	baseline: &Manifest,
	live: &Manifest,
	removed: &BTreeSet<String>,
) -> Option<Conflict> {
	let path = half.path();
	if live.content(path) != ContentState::Absent {
		return None;
	}
	let make = |kind, blocking: &str| {
		Conflict::new(path, kind, baseline.content(path), live.content(blocking), half.wanted())
			.blocked_by(blocking)
	};

	for ancestor in validation::ancestors(path) {
		let Some(entry) = live.get(ancestor) else { continue };
		if removed.contains(ancestor) {
			continue;
		}
		match entry.kind {
			EntryKind::Error => return Some(make(ConflictType::Unreadable, ancestor)),
			EntryKind::File | EntryKind::Symlink => {
				return Some(make(ConflictType::TypeMismatch, ancestor))
			}
			EntryKind::Deleted => {}
		}
	}

	live.descendants(path)
		.find(|(p, _)| !removed.contains(p.as_str()))
		.map(|(p, _)| make(ConflictType::TypeMismatch, p))
}


// vim: ts=4
