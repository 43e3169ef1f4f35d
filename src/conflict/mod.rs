//! Conflict detection
//!
//! A sync is checked path by path against the server's live manifest, using
//! the client's baseline as the expected prior value. Paths whose live state
//! moved since the baseline are reported; every other path proceeds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ContentHash, ContentState};

pub mod resolver;

pub use resolver::{ConflictResolver, Resolution};

/// Types of conflicts that can occur
///
/// Two-word names read server side first, client side second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
	/// Changed on the server, changed differently by the client
	ModifyModify,

	/// Changed on the server, deleted by the client
	ModifyDelete,

	/// Deleted on the server, changed by the client
	DeleteModify,

	/// Created on both sides with different content
	CreateCreate,

	/// File vs directory collision (an ancestor is a file, or the path has
	/// live entries below it)
	TypeMismatch,

	/// The live path (or an ancestor) could not be read
	Unreadable,
}

impl ConflictType {
	/// Classify a content divergence at a single path
	pub fn classify(baseline: ContentState, server: ContentState, client: ContentState) -> Self {
		match (baseline, server, client) {
			(_, ContentState::Unreadable, _) => ConflictType::Unreadable,
			(ContentState::Absent, _, _) => ConflictType::CreateCreate,
			(_, ContentState::Absent, _) => ConflictType::DeleteModify,
			(_, _, ContentState::Absent) => ConflictType::ModifyDelete,
			_ => ConflictType::ModifyModify,
		}
	}
}

impl fmt::Display for ConflictType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ConflictType::ModifyModify => "modify-modify",
			ConflictType::ModifyDelete => "modify-delete",
			ConflictType::DeleteModify => "delete-modify",
			ConflictType::CreateCreate => "create-create",
			ConflictType::TypeMismatch => "type-mismatch",
			ConflictType::Unreadable => "unreadable",
		};
		write!(f, "{}", name)
	}
}

/// A rejected path, with every competing version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
	pub path: String,

	pub kind: ConflictType,

	/// Content the client last synced (None: absent)
	pub baseline: Option<ContentHash>,

	/// Content the server holds now (None: absent or unreadable)
	pub server: Option<ContentHash>,

	/// Content the client wants (None: delete)
	pub client: Option<ContentHash>,

	/// Live path that collides with this one (type-mismatch only)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub blocking: Option<String>,
}

impl Conflict {
	pub fn new(
		path: impl Into<String>,
		kind: ConflictType,
		baseline: ContentState,
		server: ContentState,
		client: ContentState,
	) -> Self {
		Conflict {
			path: path.into(),
			kind,
			baseline: baseline.hash(),
			server: server.hash(),
			client: client.hash(),
			blocking: None,
		}
	}

	pub fn blocked_by(mut self, path: impl Into<String>) -> Self {
		self.blocking = Some(path.into());
		self
	}
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let show = |h: &Option<ContentHash>| h.map(|h| h.short()).unwrap_or_else(|| "-".to_string());
		write!(
			f,
			"{} ({}): baseline {}, server {}, client {}",
			self.path,
			self.kind,
			show(&self.baseline),
			show(&self.server),
			show(&self.client)
		)?;
		if let Some(blocking) = &self.blocking {
			write!(f, ", blocked by {}", blocking)?;
		}
		Ok(())
	}
}


// vim: ts=4
