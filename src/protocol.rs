//! Request/response envelope for the transport collaborator
//!
//! The launcher deserializes a [`SyncRequest`] from an authenticated request
//! body, passes it to [`crate::engine::SyncEngine::handle`] and serializes the
//! [`SyncResponse`] it gets back. Chunk bytes travel as base64 strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk_tracker::ChunkAck;
use crate::diff::ChangeSet;
use crate::error::SyncError;
use crate::manifest::Manifest;
use crate::repository::{CommitOutcome, SyncPlan};
use crate::state::HistoryRecord;
use crate::store::GcReport;
use crate::types::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncRequest {
	GetManifest {
		repository: String,
	},
	BeginSync {
		repository: String,
		baseline: Manifest,
		target: Manifest,
	},
	PutChunk {
		transaction_id: Uuid,
		hash: ContentHash,
		offset: u64,
		#[serde(with = "base64_bytes")]
		data: Vec<u8>,
	},
	CommitSync {
		transaction_id: Uuid,
		/// Kept in the history record
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message: Option<String>,
	},
	AbortSync {
		transaction_id: Uuid,
	},
	ReadChunk {
		repository: String,
		hash: ContentHash,
		offset: u64,
	},
	ListHistory {
		repository: String,
	},
	ListChanges {
		repository: String,
		revision: u64,
	},
	CollectGarbage {
		repository: String,
	},
}

impl SyncRequest {
	/// Request name for logs
	pub fn name(&self) -> &'static str {
		match self {
			SyncRequest::GetManifest { .. } => "get-manifest",
			SyncRequest::BeginSync { .. } => "begin-sync",
			SyncRequest::PutChunk { .. } => "put-chunk",
			SyncRequest::CommitSync { .. } => "commit-sync",
			SyncRequest::AbortSync { .. } => "abort-sync",
			SyncRequest::ReadChunk { .. } => "read-chunk",
			SyncRequest::ListHistory { .. } => "list-history",
			SyncRequest::ListChanges { .. } => "list-changes",
			SyncRequest::CollectGarbage { .. } => "collect-garbage",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncResponse {
	Manifest {
		manifest: Manifest,
	},
	Plan(SyncPlan),
	ChunkAck(ChunkAck),
	Committed(CommitOutcome),
	Aborted {
		transaction_id: Uuid,
	},
	Chunk {
		hash: ContentHash,
		offset: u64,
		#[serde(with = "base64_bytes")]
		data: Vec<u8>,
	},
	History {
		records: Vec<HistoryRecord>,
	},
	Changes {
		revision: u64,
		changes: ChangeSet,
	},
	Garbage {
		removed: usize,
		bytes_freed: u64,
	},
	Error(ErrorBody),
}

impl From<GcReport> for SyncResponse {
	fn from(report: GcReport) -> Self {
		SyncResponse::Garbage { removed: report.removed, bytes_freed: report.bytes_freed }
	}
}

impl From<SyncError> for SyncResponse {
	fn from(err: SyncError) -> Self {
		SyncResponse::Error(ErrorBody::from(&err))
	}
}

/// Wire form of a [`SyncError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub kind: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub paths: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub hashes: Vec<ContentHash>,
}

impl From<&SyncError> for ErrorBody {
	fn from(err: &SyncError) -> Self {
		ErrorBody {
			kind: err.kind().to_string(),
			message: err.to_string(),
			paths: err.paths(),
			hashes: err.hashes(),
		}
	}
}

mod base64_bytes {
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine as _;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(data))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
	}
}


// vim: ts=4
