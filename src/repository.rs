//! Per-repository server state
//!
//! A [`Repository`] owns everything one synced tree needs at runtime: the
//! content store and upload tracker, the state database, the live manifest,
//! the commit lock and the table of open transactions. It is opened
//! explicitly (replaying an interrupted commit if one is found) and closed
//! explicitly (aborting whatever is still in flight).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as afs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::chunk_tracker::{chunk_len, ChunkAck, NeededBlob, UploadTracker, CHUNK_SIZE};
use crate::config::RepositoryConfig;
use crate::conflict::{Conflict, ConflictResolver};
use crate::diff::ChangeSet;
use crate::error::SyncError;
use crate::exclusion::ExclusionEngine;
use crate::journal::{CommitJournal, JOURNAL_FILE};
use crate::logging::*;
use crate::manifest::{Manifest, ManifestBuilder};
use crate::state::{HistoryRecord, StateDb};
use crate::store::{ContentStore, GcReport};
use crate::transaction::{ResolutionStatus, Transaction, TransactionState};
use crate::types::{ContentHash, EntryKind};
use crate::validation::to_fs_path;

const STATE_DB_FILE: &str = "state.redb";
const STAGING_DIR: &str = "staging";

/// Answer to `BeginSync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
	pub transaction_id: Uuid,
	pub status: ResolutionStatus,
	/// Blobs the client must upload, with the chunks still missing
	pub needed: Vec<NeededBlob>,
	pub conflicts: Vec<Conflict>,
	/// Operations that will be applied on commit
	pub changes: ChangeSet,
	/// Paths skipped because the server already holds the client's target
	pub converged: Vec<String>,
	pub chunk_size: u64,
}

/// Answer to `CommitSync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
	pub revision: u64,
	/// Number of operations applied to the live tree
	pub applied: usize,
}

type TransactionHandle = Arc<Mutex<Transaction>>;

/// Why a swap did not complete
enum SwapError {
	/// Nothing was written; the live tree is unchanged
	Rejected(SyncError),
	/// The journal exists, so replay will finish the commit
	Interrupted(SyncError),
}

impl From<SyncError> for SwapError {
	fn from(e: SyncError) -> Self {
		SwapError::Rejected(e)
	}
}

pub struct Repository {
	name: String,
	config: RepositoryConfig,
	uploads: UploadTracker,
	state: Arc<StateDb>,
	exclusion: Arc<ExclusionEngine>,
	resolver: ConflictResolver,
	live: RwLock<Manifest>,
	commit_lock: Mutex<()>,
	transactions: Mutex<BTreeMap<Uuid, TransactionHandle>>,
	/// Held shared while a transaction registers and claims its blobs,
	/// exclusively while garbage is collected
	gc_gate: RwLock<()>,
	staging_root: PathBuf,
	journal_path: PathBuf,
	/// Set when a swap failed after its journal was written
	needs_recovery: AtomicBool,
}

impl std::fmt::Debug for Repository {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Repository")
			.field("name", &self.name)
			.field("path", &self.config.path)
			.finish()
	}
}

impl Repository {
	/// Open a repository, finishing any interrupted commit first
	pub async fn open(name: impl Into<String>, config: RepositoryConfig) -> Result<Self, SyncError> {
		let name = name.into();
		let data_dir = config.data_dir();
		afs::create_dir_all(&data_dir).await.map_err(|e| SyncError::io(&data_dir, e))?;

		let store = ContentStore::open(&data_dir).await?.with_max_blob_size(config.max_blob_size);
		// Upload progress is tracked in memory only, so partials cannot be resumed
		store.clear_partials().await?;
		let state = Arc::new(StateDb::open(&data_dir.join(STATE_DB_FILE))?);
		let exclusion = Arc::new(ExclusionEngine::from_config(&config)?);

		let repo = Repository {
			resolver: ConflictResolver::new(config.data_dir_name.clone()),
			uploads: UploadTracker::new(store),
			state,
			exclusion,
			live: RwLock::new(Manifest::new()),
			commit_lock: Mutex::new(()),
			transactions: Mutex::new(BTreeMap::new()),
			gc_gate: RwLock::new(()),
			staging_root: data_dir.join(STAGING_DIR),
			journal_path: data_dir.join(JOURNAL_FILE),
			needs_recovery: AtomicBool::new(false),
			name,
			config,
		};

		{
			let _guard = repo.commit_lock.lock().await;
			repo.replay_journal().await?;
			remove_dir_if_exists(&repo.staging_root).await?;
			let mut live = repo.live.write().await;
			*live = repo.scan().await?;
		}
		info!(
			"[repo {}] opened {} ({} entries, revision {})",
			repo.name,
			repo.config.path.display(),
			repo.live.read().await.len(),
			repo.state.head_revision()?
		);
		Ok(repo)
	}

	/// Abort every open transaction
	pub async fn close(&self) -> Result<(), SyncError> {
		let open: Vec<TransactionHandle> =
			std::mem::take(&mut *self.transactions.lock().await).into_values().collect();
		for handle in open {
			let mut tx = handle.lock().await;
			if !tx.state().is_terminal() {
				tx.abort().await?;
			}
		}
		info!("[repo {}] closed", self.name);
		Ok(())
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &RepositoryConfig {
		&self.config
	}

	pub fn store(&self) -> &ContentStore {
		self.uploads.store()
	}

	/// Snapshot of the live manifest
	pub async fn manifest(&self) -> Manifest {
		self.live.read().await.clone()
	}

	pub fn head_revision(&self) -> Result<u64, SyncError> {
		Ok(self.state.head_revision()?)
	}

	pub fn history(&self) -> Result<Vec<HistoryRecord>, SyncError> {
		Ok(self.state.history()?)
	}

	/// Operations committed as `revision`
	pub fn changes(&self, revision: u64) -> Result<ChangeSet, SyncError> {
		self.state
			.changes(revision)?
			.ok_or_else(|| SyncError::protocol(format!("Repository {} has no revision {}", self.name, revision)))
	}

	/// Rebuild the live manifest from disk (picks up changes made outside sync)
	pub async fn rescan(&self) -> Result<(), SyncError> {
		self.ensure_recovered().await?;
		let _guard = self.commit_lock.lock().await;
		let fresh = self.scan().await?;
		*self.live.write().await = fresh;
		Ok(())
	}

	/// Start a transaction for a client's baseline and target
	pub async fn begin_sync(&self, baseline: Manifest, target: Manifest) -> Result<SyncPlan, SyncError> {
		let baseline = baseline.checked()?;
		let target = target.checked()?;
		self.ensure_recovered().await?;
		self.sweep_idle().await;

		let mut tx = Transaction::new(baseline, target, &self.staging_root);
		tx.mark_diffed();
		let resolution = {
			let live = self.live.read().await;
			self.resolver.resolve(tx.baseline(), tx.target(), &live)?
		};
		self.check_excluded(&resolution.changes)?;
		let status = tx.resolve(resolution);
		let id = tx.id;
		let required: Vec<(ContentHash, u64)> =
			tx.required_blobs().iter().map(|(h, s)| (*h, *s)).collect();
		let plan_parts = (
			tx.resolution().conflicts.clone(),
			tx.resolution().changes.clone(),
			tx.resolution().converged.clone(),
		);

		// Register before asking for blobs so garbage collection sees them
		let gate = self.gc_gate.read().await;
		let handle = Arc::new(Mutex::new(tx));
		self.transactions.lock().await.insert(id, handle.clone());

		let mut needed = Vec::new();
		for (hash, size) in required {
			match self.uploads.expect(&hash, size).await {
				Ok(Some(blob)) => needed.push(blob),
				Ok(None) => {}
				Err(e) => {
					drop(gate);
					self.discard(id, &handle).await;
					return Err(e);
				}
			}
		}
		drop(gate);

		let (conflicts, changes, converged) = plan_parts;
		info!(
			"[repo {}] transaction {} {}: {} ops, {} conflicts, {} blobs needed",
			self.name,
			id,
			match status {
				ResolutionStatus::Clean => "clean",
				ResolutionStatus::Conflict => "has conflicts",
			},
			changes.len(),
			conflicts.len(),
			needed.len()
		);
		Ok(SyncPlan { transaction_id: id, status, needed, conflicts, changes, converged, chunk_size: CHUNK_SIZE })
	}

	/// Accept one uploaded chunk for transaction `id`
	///
	/// An integrity failure leaves the transaction open and re-arms the blob so
	/// the client can send it again; I/O and protocol errors abort it.
	pub async fn put_chunk(
		&self,
		id: Uuid,
		hash: &ContentHash,
		offset: u64,
		data: &[u8],
	) -> Result<ChunkAck, SyncError> {
		let handle = self.transaction(id).await?;
		let result = async {
			let size = {
				let mut tx = handle.lock().await;
				tx.require("put_chunk", &resolved_states())?;
				tx.touch();
				tx.needs(hash).ok_or_else(|| {
					SyncError::protocol(format!("Transaction {} does not need blob {}", id, hash))
				})?
			};
			match self.uploads.put_chunk(hash, offset, data).await {
				Err(SyncError::Integrity { hash, actual }) => {
					self.uploads.expect(&hash, size).await?;
					Err(SyncError::Integrity { hash, actual })
				}
				other => other,
			}
		}
		.await;

		if let Err(e) = &result {
			if e.aborts_transaction() {
				warn!("[repo {}] aborting transaction {}: {}", self.name, id, e);
				self.discard(id, &handle).await;
			}
		}
		result
	}

	/// Stage and swap in the accepted changes of transaction `id`
	///
	/// Any failure before the journal is written aborts the transaction and
	/// leaves the live tree untouched.
	pub async fn commit_sync(&self, id: Uuid, message: Option<String>) -> Result<CommitOutcome, SyncError> {
		self.ensure_recovered().await?;
		let handle = self.transaction(id).await?;
		let mut tx = handle.lock().await;
		let mut allowed = resolved_states().to_vec();
		allowed.push(TransactionState::Staged);
		tx.require("commit", &allowed)?;
		tx.touch();

		let staged = if tx.state() == TransactionState::Staged {
			Ok(())
		} else {
			tx.stage(self.store()).await
		};
		let result = match staged {
			Ok(()) => self.swap(&tx, message).await,
			Err(e) => Err(SwapError::Rejected(e)),
		};

		self.transactions.lock().await.remove(&id);
		match result {
			Ok(outcome) => {
				tx.mark_committed();
				if let Err(e) = tx.discard_staging().await {
					warn!("[repo {}] cannot remove staging of {}: {}", self.name, id, e);
				}
				info!(
					"[repo {}] committed {} as revision {} ({} ops)",
					self.name, id, outcome.revision, outcome.applied
				);
				Ok(outcome)
			}
			// The journal references this staging directory; replay needs it
			Err(SwapError::Interrupted(e)) => Err(e),
			Err(SwapError::Rejected(e)) => {
				warn!("[repo {}] commit of {} aborted: {}", self.name, id, e);
				if let Err(abort_err) = tx.abort().await {
					warn!("[repo {}] cleanup of {} failed: {}", self.name, id, abort_err);
				}
				Err(e)
			}
		}
	}

	/// Abort transaction `id` and discard its staging
	pub async fn abort_sync(&self, id: Uuid) -> Result<(), SyncError> {
		let handle = self.transaction(id).await?;
		let mut tx = handle.lock().await;
		tx.abort().await?;
		self.transactions.lock().await.remove(&id);
		info!("[repo {}] aborted transaction {}", self.name, id);
		Ok(())
	}

	/// Read one chunk of a stored blob
	pub async fn read_chunk(&self, hash: &ContentHash, offset: u64) -> Result<Vec<u8>, SyncError> {
		let size = self.store().size(hash).await?;
		if offset % CHUNK_SIZE != 0 || (offset >= size && !(offset == 0 && size == 0)) {
			return Err(SyncError::protocol(format!(
				"Offset {} is not a chunk of blob {} ({} bytes)",
				offset, hash, size
			)));
		}
		let len = chunk_len(size, offset);
		trace!("[repo {}] read {}@{} ({} bytes)", self.name, hash.short(), offset, len);
		Ok(self.store().read_range(hash, offset, len as usize).await?)
	}

	/// Remove blobs unreachable from the live tree, open transactions and uploads
	pub async fn collect_garbage(&self) -> Result<GcReport, SyncError> {
		let _gate = self.gc_gate.write().await;
		// Transaction locks come before the commit lock (commit_sync holds both)
		let mut reachable = BTreeSet::new();
		let open: Vec<TransactionHandle> = self.transactions.lock().await.values().cloned().collect();
		for handle in open {
			reachable.extend(handle.lock().await.required_blobs().keys().copied());
		}
		let _guard = self.commit_lock.lock().await;
		reachable.extend(self.live.read().await.hashes());
		reachable.extend(self.uploads.in_flight().await);
		Ok(self.store().gc(&reachable).await?)
	}

	/// Ids of transactions still open
	pub async fn open_transactions(&self) -> Vec<Uuid> {
		self.transactions.lock().await.keys().copied().collect()
	}

	async fn transaction(&self, id: Uuid) -> Result<TransactionHandle, SyncError> {
		self.transactions
			.lock()
			.await
			.get(&id)
			.cloned()
			.ok_or(SyncError::UnknownTransaction { id })
	}

	/// Drop a transaction from the table and abort it
	async fn discard(&self, id: Uuid, handle: &TransactionHandle) {
		self.transactions.lock().await.remove(&id);
		if let Err(e) = handle.lock().await.abort().await {
			warn!("[repo {}] cleanup of {} failed: {}", self.name, id, e);
		}
	}

	/// Abort transactions idle for longer than the configured timeout
	async fn sweep_idle(&self) {
		let timeout = Duration::from_secs(self.config.transaction_timeout_secs);
		let candidates: Vec<(Uuid, TransactionHandle)> =
			self.transactions.lock().await.iter().map(|(id, h)| (*id, h.clone())).collect();
		for (id, handle) in candidates {
			// A locked transaction is busy, hence not idle
			let Ok(mut tx) = handle.try_lock() else { continue };
			if tx.idle_for() < timeout {
				continue;
			}
			info!("[repo {}] transaction {} timed out", self.name, id);
			self.transactions.lock().await.remove(&id);
			if let Err(e) = tx.abort().await {
				warn!("[repo {}] cleanup of {} failed: {}", self.name, id, e);
			}
		}
	}

	/// Changes may not write paths this repository excludes from its scans
	fn check_excluded(&self, changes: &ChangeSet) -> Result<(), SyncError> {
		let excluded: Vec<String> = changes
			.touched_paths()
			.into_iter()
			.filter(|p| self.exclusion.should_exclude(p))
			.map(String::from)
			.collect();
		if excluded.is_empty() {
			Ok(())
		} else {
			Err(SyncError::Protocol { message: "Paths are excluded from this repository".to_string(), paths: excluded })
		}
	}

	/// Re-resolve, journal and apply under the commit lock
	async fn swap(&self, tx: &Transaction, message: Option<String>) -> Result<CommitOutcome, SwapError> {
		let _guard = self.commit_lock.lock().await;
		let mut live = self.live.write().await;
		let resolution = self.resolver.recheck(tx.resolution(), tx.baseline(), tx.target(), &live)?;
		if resolution.changes.is_empty() {
			return Ok(CommitOutcome { revision: self.head_revision()?, applied: 0 });
		}

		let revision = self.head_revision()? + 1;
		let journal = CommitJournal::plan(tx.id, tx.staging_dir(), &resolution.changes, tx.staged(), revision)?
			.with_message(message);
		journal.write(&self.journal_path).await?;

		match self.finish_commit(&journal, &mut live).await {
			Ok(()) => Ok(CommitOutcome { revision, applied: resolution.changes.len() }),
			Err(e) => {
				error!(
					"[repo {}] commit of revision {} interrupted, will replay: {}",
					self.name, revision, e
				);
				self.needs_recovery.store(true, Ordering::SeqCst);
				Err(SwapError::Interrupted(e))
			}
		}
	}

	async fn finish_commit(&self, journal: &CommitJournal, live: &mut Manifest) -> Result<(), SyncError> {
		journal.apply(&self.config.path).await?;
		self.state.record_commit(&journal.history, &journal.changes)?;
		*live = journal.changes.apply_to(live);
		CommitJournal::remove(&self.journal_path).await
	}

	/// Replay an interrupted commit left behind by a failed swap
	async fn ensure_recovered(&self) -> Result<(), SyncError> {
		if !self.needs_recovery.load(Ordering::SeqCst) {
			return Ok(());
		}
		let _guard = self.commit_lock.lock().await;
		if !self.needs_recovery.load(Ordering::SeqCst) {
			return Ok(());
		}
		self.replay_journal().await?;
		let fresh = self.scan().await?;
		*self.live.write().await = fresh;
		self.needs_recovery.store(false, Ordering::SeqCst);
		Ok(())
	}

	/// Finish the commit recorded in the journal, if there is one.
	/// Caller holds the commit lock.
	async fn replay_journal(&self) -> Result<(), SyncError> {
		let Some(journal) = CommitJournal::load(&self.journal_path).await? else {
			return Ok(());
		};
		warn!(
			"[repo {}] replaying interrupted commit of revision {} (transaction {})",
			self.name, journal.history.revision, journal.transaction
		);
		journal.apply(&self.config.path).await?;
		self.state.record_commit(&journal.history, &journal.changes)?;
		remove_dir_if_exists(&journal.staging_dir).await?;
		CommitJournal::remove(&self.journal_path).await?;
		info!("[repo {}] recovered revision {}", self.name, journal.history.revision);
		Ok(())
	}

	/// Build the live manifest and make sure the store holds its content
	async fn scan(&self) -> Result<Manifest, SyncError> {
		let mut builder = ManifestBuilder::new(&self.config.path).with_exclusion(self.exclusion.clone());
		if self.config.fast_path {
			builder = builder.with_cache(self.state.clone());
		}
		let manifest = builder.build_async().await?;
		self.ingest(&manifest).await?;
		Ok(manifest)
	}

	/// Copy live content the store is missing into it
	async fn ingest(&self, manifest: &Manifest) -> Result<(), SyncError> {
		let store = self.store();
		let mut seen = BTreeSet::new();
		let mut ingested = 0usize;
		for (path, entry) in manifest.iter() {
			let Some(hash) = entry.hash else { continue };
			if !seen.insert(hash) || store.has(&hash).await {
				continue;
			}
			let fs_path = to_fs_path(&self.config.path, path);
			match entry.kind {
				EntryKind::File => {
					let (actual, _) = store.put_file(&fs_path).await?;
					if actual != hash {
						warn!("[repo {}] {} changed while scanning", self.name, path);
					}
				}
				EntryKind::Symlink => {
					let target = afs::read_link(&fs_path).await.map_err(|e| SyncError::io(&fs_path, e))?;
					store.put(target.to_string_lossy().as_bytes()).await?;
				}
				EntryKind::Deleted | EntryKind::Error => continue,
			}
			ingested += 1;
		}
		if ingested > 0 {
			debug!("[repo {}] ingested {} blobs from the live tree", self.name, ingested);
		}
		Ok(())
	}
}

fn resolved_states() -> [TransactionState; 2] {
	[
		TransactionState::Resolved(ResolutionStatus::Clean),
		TransactionState::Resolved(ResolutionStatus::Conflict),
	]
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), SyncError> {
	match afs::remove_dir_all(dir).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SyncError::io(dir, e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Entry;

	fn write(root: &Path, path: &str, data: &[u8]) {
		let full = root.join(path);
		std::fs::create_dir_all(full.parent().unwrap()).unwrap();
		std::fs::write(full, data).unwrap();
	}

	async fn open(root: &Path) -> Repository {
		Repository::open("main", RepositoryConfig::new(root)).await.unwrap()
	}

	#[tokio::test]
	async fn test_open_scans_and_ingests() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"alpha");
		std::os::unix::fs::symlink("a.txt", dir.path().join("link")).unwrap();
		let repo = open(dir.path()).await;

		let live = repo.manifest().await;
		assert_eq!(live.len(), 2);
		assert!(repo.store().has(&ContentHash::of(b"alpha")).await);
		assert!(repo.store().has(&ContentHash::of(b"a.txt")).await);
		assert!(live.get(".reposync/state.redb").is_none());
		assert_eq!(repo.head_revision().unwrap(), 0);
	}

	#[tokio::test]
	async fn test_begin_sync_rejects_excluded_paths() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = RepositoryConfig::new(dir.path());
		config.exclude_patterns = vec!["*.tmp".to_string()];
		let repo = Repository::open("main", config).await.unwrap();

		let mut target = Manifest::new();
		target.insert("scratch.tmp", Entry::file(ContentHash::of(b"x"), 1, 0o644, 0));
		let err = repo.begin_sync(Manifest::new(), target).await.unwrap_err();
		assert_eq!(err.kind(), "protocol");
		assert_eq!(err.paths(), vec!["scratch.tmp".to_string()]);
		assert!(repo.open_transactions().await.is_empty());
	}

	#[tokio::test]
	async fn test_abort_and_unknown_transaction() {
		let dir = tempfile::tempdir().unwrap();
		let repo = open(dir.path()).await;
		let mut target = Manifest::new();
		target.insert("f", Entry::file(ContentHash::of(b"f"), 1, 0o644, 0));

		let plan = repo.begin_sync(Manifest::new(), target).await.unwrap();
		assert_eq!(plan.needed.len(), 1);
		repo.abort_sync(plan.transaction_id).await.unwrap();
		let err = repo.commit_sync(plan.transaction_id, None).await.unwrap_err();
		assert!(matches!(err, SyncError::UnknownTransaction { .. }));
	}

	#[tokio::test]
	async fn test_idle_transactions_are_swept() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = RepositoryConfig::new(dir.path());
		config.transaction_timeout_secs = 0;
		let repo = Repository::open("main", config).await.unwrap();

		let first = repo.begin_sync(Manifest::new(), Manifest::new()).await.unwrap();
		let second = repo.begin_sync(Manifest::new(), Manifest::new()).await.unwrap();
		assert_eq!(repo.open_transactions().await, vec![second.transaction_id]);
		assert_ne!(first.transaction_id, second.transaction_id);
	}

	#[tokio::test]
	async fn test_read_chunk_checks_alignment() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"alpha");
		let repo = open(dir.path()).await;
		let hash = ContentHash::of(b"alpha");
		assert_eq!(repo.read_chunk(&hash, 0).await.unwrap(), b"alpha");
		assert!(repo.read_chunk(&hash, 3).await.is_err());
		assert!(repo.read_chunk(&ContentHash::of(b"nope"), 0).await.is_err());
	}

	#[tokio::test]
	async fn test_gc_pins_live_tree_and_open_transactions() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"alpha");
		let repo = open(dir.path()).await;
		let pinned = repo.store().put(b"pinned").await.unwrap();
		let orphan = repo.store().put(b"orphan").await.unwrap();

		let mut target = Manifest::new();
		target.insert("p", Entry::file(pinned, 6, 0o644, 0));
		let plan = repo.begin_sync(Manifest::new(), target).await.unwrap();
		assert!(plan.needed.is_empty());

		let report = repo.collect_garbage().await.unwrap();
		assert_eq!(report.removed, 1);
		assert!(!repo.store().has(&orphan).await);
		assert!(repo.store().has(&pinned).await);
		assert!(repo.store().has(&ContentHash::of(b"alpha")).await);
	}

	#[tokio::test]
	async fn test_begin_sync_waits_for_gc_before_claiming_blobs() {
		let dir = tempfile::tempdir().unwrap();
		let repo = Arc::new(open(dir.path()).await);
		let stored = repo.store().put(b"already here").await.unwrap();
		let mut target = Manifest::new();
		target.insert("f", Entry::file(stored, 12, 0o644, 0));

		let gate = repo.gc_gate.write().await;
		let task = {
			let repo = repo.clone();
			tokio::spawn(async move { repo.begin_sync(Manifest::new(), target).await })
		};
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		assert!(repo.open_transactions().await.is_empty());
		drop(gate);

		let plan = task.await.unwrap().unwrap();
		assert!(plan.needed.is_empty());
		repo.collect_garbage().await.unwrap();
		assert!(repo.store().has(&stored).await);
		assert_eq!(repo.commit_sync(plan.transaction_id, None).await.unwrap().applied, 1);
	}

	#[tokio::test]
	async fn test_begin_sync_rejects_unchecked_paths() {
		let dir = tempfile::tempdir().unwrap();
		let repo = open(dir.path()).await;
		let mut target = Manifest::new();
		target.insert("../escape.txt", Entry::file(ContentHash::of(b"x"), 1, 0o644, 0));
		let err = repo.begin_sync(Manifest::new(), target).await.unwrap_err();
		assert_eq!(err.kind(), "protocol");
		assert!(repo.open_transactions().await.is_empty());
		assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
	}

	#[tokio::test]
	async fn test_full_st_mode_is_not_a_metadata_change() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"alpha");
		let repo = open(dir.path()).await;
		let live = repo.manifest().await;

		let mut target = live.clone();
		let mut entry = live.get("a.txt").unwrap().clone();
		entry.mode |= 0o100000;
		target.insert("a.txt", entry);
		let plan = repo.begin_sync(live, target).await.unwrap();
		assert!(plan.changes.is_empty());
	}

	#[tokio::test]
	async fn test_rejected_swap_cleans_up_despite_pending_recovery() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "a.txt", b"v1");
		let repo = Arc::new(open(dir.path()).await);
		let baseline = repo.manifest().await;
		let mut target = baseline.clone();
		target.insert("a.txt", Entry::file(ContentHash::of(b"v2"), 2, 0o644, 0));
		let plan = repo.begin_sync(baseline, target).await.unwrap();
		repo.put_chunk(plan.transaction_id, &ContentHash::of(b"v2"), 0, b"v2").await.unwrap();
		let staging = repo.staging_root.join(plan.transaction_id.to_string());

		// Park the commit at the commit lock, after staging
		let held = repo.commit_lock.lock().await;
		let task = {
			let repo = repo.clone();
			tokio::spawn(async move { repo.commit_sync(plan.transaction_id, None).await })
		};
		while !staging.exists() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		// Another transaction's swap failed after journaling, and live moved on
		repo.needs_recovery.store(true, Ordering::SeqCst);
		repo.live.write().await.insert("a.txt", Entry::file(ContentHash::of(b"other"), 5, 0o644, 0));
		drop(held);

		let err = task.await.unwrap().unwrap_err();
		assert_eq!(err.kind(), "conflict");
		assert!(!staging.exists());
		assert!(repo.open_transactions().await.is_empty());
	}
}

// vim: ts=4
