//! Sync engine entry points
//!
//! One [`SyncEngine`] serves every configured repository. Transaction ids are
//! global, so chunk, commit and abort requests only name the transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chunk_tracker::ChunkAck;
use crate::config::ServerConfig;
use crate::diff::ChangeSet;
use crate::error::SyncError;
use crate::logging::*;
use crate::manifest::Manifest;
use crate::protocol::{SyncRequest, SyncResponse};
use crate::repository::{CommitOutcome, Repository, SyncPlan};
use crate::state::HistoryRecord;
use crate::store::GcReport;
use crate::types::ContentHash;
use crate::validation::Validator;

pub struct SyncEngine {
	repositories: BTreeMap<String, Arc<Repository>>,
	/// Transaction id -> owning repository
	routes: Mutex<HashMap<Uuid, Arc<Repository>>>,
}

impl SyncEngine {
	/// Validate the configuration and open every repository
	pub async fn open(config: ServerConfig) -> Result<Self, SyncError> {
		config.validate().map_err(|e| SyncError::InvalidConfig { message: e.to_string() })?;
		let mut repositories = BTreeMap::new();
		for (name, repo_config) in config.repositories {
			let repo = Repository::open(name.clone(), repo_config).await?;
			repositories.insert(name, Arc::new(repo));
		}
		info!("Sync engine ready with {} repositories", repositories.len());
		Ok(SyncEngine { repositories, routes: Mutex::new(HashMap::new()) })
	}

	/// Abort every open transaction in every repository
	pub async fn close(&self) -> Result<(), SyncError> {
		self.routes.lock().await.clear();
		for repo in self.repositories.values() {
			repo.close().await?;
		}
		Ok(())
	}

	pub fn repository(&self, name: &str) -> Result<&Arc<Repository>, SyncError> {
		self.repositories
			.get(name)
			.ok_or_else(|| SyncError::UnknownRepository { name: name.to_string() })
	}

	pub async fn get_manifest(&self, repository: &str) -> Result<Manifest, SyncError> {
		Ok(self.repository(repository)?.manifest().await)
	}

	pub async fn begin_sync(
		&self,
		repository: &str,
		baseline: Manifest,
		target: Manifest,
	) -> Result<SyncPlan, SyncError> {
		let repo = self.repository(repository)?.clone();
		self.prune_routes().await;
		let plan = repo.begin_sync(baseline, target).await?;
		self.routes.lock().await.insert(plan.transaction_id, repo);
		Ok(plan)
	}

	pub async fn put_chunk(
		&self,
		transaction_id: Uuid,
		hash: &ContentHash,
		offset: u64,
		data: &[u8],
	) -> Result<ChunkAck, SyncError> {
		let repo = self.route(transaction_id).await?;
		self.forget_if_gone(transaction_id, repo.put_chunk(transaction_id, hash, offset, data).await).await
	}

	pub async fn commit_sync(&self, transaction_id: Uuid, message: Option<String>) -> Result<CommitOutcome, SyncError> {
		let repo = self.route(transaction_id).await?;
		let result = repo.commit_sync(transaction_id, message).await;
		// Committed or aborted, the transaction is finished either way
		if !matches!(result, Err(SyncError::InvalidState { .. })) {
			self.routes.lock().await.remove(&transaction_id);
		}
		result
	}

	pub async fn abort_sync(&self, transaction_id: Uuid) -> Result<(), SyncError> {
		let repo = self.route(transaction_id).await?;
		let result = repo.abort_sync(transaction_id).await;
		self.forget_if_gone(transaction_id, result).await
	}

	pub async fn read_chunk(&self, repository: &str, hash: &ContentHash, offset: u64) -> Result<Vec<u8>, SyncError> {
		self.repository(repository)?.read_chunk(hash, offset).await
	}

	pub async fn list_history(&self, repository: &str) -> Result<Vec<HistoryRecord>, SyncError> {
		self.repository(repository)?.history()
	}

	pub async fn list_changes(&self, repository: &str, revision: u64) -> Result<ChangeSet, SyncError> {
		self.repository(repository)?.changes(revision)
	}

	pub async fn collect_garbage(&self, repository: &str) -> Result<GcReport, SyncError> {
		self.repository(repository)?.collect_garbage().await
	}

	/// Dispatch one envelope request; errors become [`SyncResponse::Error`]
	pub async fn handle(&self, request: SyncRequest) -> SyncResponse {
		let name = request.name();
		let result = self.dispatch(request).await;
		match result {
			Ok(response) => response,
			Err(e) => {
				debug!("Request {} failed: {}", name, e);
				e.into()
			}
		}
	}

	async fn dispatch(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
		Ok(match request {
			SyncRequest::GetManifest { repository } => {
				SyncResponse::Manifest { manifest: self.get_manifest(&repository).await? }
			}
			SyncRequest::BeginSync { repository, baseline, target } => {
				SyncResponse::Plan(self.begin_sync(&repository, baseline, target).await?)
			}
			SyncRequest::PutChunk { transaction_id, hash, offset, data } => {
				SyncResponse::ChunkAck(self.put_chunk(transaction_id, &hash, offset, &data).await?)
			}
			SyncRequest::CommitSync { transaction_id, message } => {
				SyncResponse::Committed(self.commit_sync(transaction_id, message).await?)
			}
			SyncRequest::AbortSync { transaction_id } => {
				self.abort_sync(transaction_id).await?;
				SyncResponse::Aborted { transaction_id }
			}
			SyncRequest::ReadChunk { repository, hash, offset } => {
				let data = self.read_chunk(&repository, &hash, offset).await?;
				SyncResponse::Chunk { hash, offset, data }
			}
			SyncRequest::ListHistory { repository } => {
				SyncResponse::History { records: self.list_history(&repository).await? }
			}
			SyncRequest::ListChanges { repository, revision } => {
				SyncResponse::Changes { revision, changes: self.list_changes(&repository, revision).await? }
			}
			SyncRequest::CollectGarbage { repository } => {
				self.collect_garbage(&repository).await?.into()
			}
		})
	}

	async fn route(&self, transaction_id: Uuid) -> Result<Arc<Repository>, SyncError> {
		self.routes
			.lock()
			.await
			.get(&transaction_id)
			.cloned()
			.ok_or(SyncError::UnknownTransaction { id: transaction_id })
	}

	/// Drop the route of a transaction the repository no longer knows
	async fn forget_if_gone<T>(&self, transaction_id: Uuid, result: Result<T, SyncError>) -> Result<T, SyncError> {
		let gone = match &result {
			Ok(_) => false,
			Err(SyncError::UnknownTransaction { .. }) => true,
			Err(e) => e.aborts_transaction(),
		};
		if gone {
			self.routes.lock().await.remove(&transaction_id);
		}
		result
	}

	/// Forget routes of transactions that were swept or closed
	async fn prune_routes(&self) {
		let mut open = HashSet::new();
		for repo in self.repositories.values() {
			open.extend(repo.open_transactions().await);
		}
		self.routes.lock().await.retain(|id, _| open.contains(id));
	}
}


// vim: ts=4
