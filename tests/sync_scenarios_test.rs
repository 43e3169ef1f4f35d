//! End-to-end sync scenarios through the engine and the reference client
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use reposync::client;
use reposync::conflict::ConflictType;
use reposync::diff::ChangeOp;
use reposync::transaction::ResolutionStatus;
use reposync::{ContentHash, Manifest, RepositoryConfig, ServerConfig, SyncEngine};

fn write(root: &Path, path: &str, data: &[u8]) {
	let full = root.join(path);
	fs::create_dir_all(full.parent().unwrap()).unwrap();
	fs::write(full, data).unwrap();
}

async fn engine(server: &Path) -> SyncEngine {
	let config = ServerConfig::default().with_repository("main", RepositoryConfig::new(server));
	SyncEngine::open(config).await.unwrap()
}

fn hash_at(manifest: &Manifest, path: &str) -> Option<ContentHash> {
	manifest.get(path).and_then(|e| e.hash)
}

#[tokio::test]
async fn test_clean_modify_and_add() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	write(server.path(), "a.txt", b"H1");
	let engine = engine(server.path()).await;

	let baseline = engine.get_manifest("main").await.unwrap();
	write(client_dir.path(), "a.txt", b"H2");
	write(client_dir.path(), "b.txt", b"H3");

	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert_eq!(report.plan.status, ResolutionStatus::Clean);
	let ops: Vec<(&str, Vec<&str>)> = report.plan.changes.iter().map(|op| (op.name(), op.paths())).collect();
	assert_eq!(ops, vec![("modify", vec!["a.txt"]), ("add", vec!["b.txt"])]);
	assert_eq!(report.outcome.revision, 1);
	assert_eq!(report.outcome.applied, 2);

	let live = engine.get_manifest("main").await.unwrap();
	assert_eq!(live.len(), 2);
	assert_eq!(hash_at(&live, "a.txt"), Some(ContentHash::of(b"H2")));
	assert_eq!(hash_at(&live, "b.txt"), Some(ContentHash::of(b"H3")));
	assert_eq!(fs::read(server.path().join("a.txt")).unwrap(), b"H2");
	assert_eq!(fs::read(server.path().join("b.txt")).unwrap(), b"H3");
}

#[tokio::test]
async fn test_stale_baseline_conflicts() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	write(server.path(), "a.txt", b"H1");
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	// Someone else changed the server after the client's baseline
	write(server.path(), "a.txt", b"H4");
	engine.repository("main").unwrap().rescan().await.unwrap();

	write(client_dir.path(), "a.txt", b"H2");
	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert_eq!(report.plan.status, ResolutionStatus::Conflict);
	assert_eq!(report.plan.conflicts.len(), 1);
	let conflict = &report.plan.conflicts[0];
	assert_eq!(conflict.path, "a.txt");
	assert_eq!(conflict.kind, ConflictType::ModifyModify);
	assert_eq!(conflict.baseline, Some(ContentHash::of(b"H1")));
	assert_eq!(conflict.server, Some(ContentHash::of(b"H4")));
	assert_eq!(conflict.client, Some(ContentHash::of(b"H2")));
	assert_eq!(report.outcome.applied, 0);

	let live = engine.get_manifest("main").await.unwrap();
	assert_eq!(hash_at(&live, "a.txt"), Some(ContentHash::of(b"H4")));
	assert_eq!(fs::read(server.path().join("a.txt")).unwrap(), b"H4");
	assert!(engine.list_history("main").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_on_one_path_lets_others_apply() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	write(server.path(), "p.txt", b"p1");
	write(server.path(), "q.txt", b"q1");
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	write(server.path(), "p.txt", b"p-server");
	engine.repository("main").unwrap().rescan().await.unwrap();

	write(client_dir.path(), "p.txt", b"p-client");
	write(client_dir.path(), "q.txt", b"q-client");
	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();

	let conflicted: Vec<&str> = report.plan.conflicts.iter().map(|c| c.path.as_str()).collect();
	assert_eq!(conflicted, vec!["p.txt"]);
	assert_eq!(report.outcome.applied, 1);
	assert_eq!(fs::read(server.path().join("p.txt")).unwrap(), b"p-server");
	assert_eq!(fs::read(server.path().join("q.txt")).unwrap(), b"q-client");

	let history = engine.list_history("main").await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].paths, vec!["q.txt".to_string()]);
	assert_eq!(history[0].modified, 1);

	let changes = engine.list_changes("main", history[0].revision).await.unwrap();
	let ops: Vec<(&str, Vec<&str>)> = changes.iter().map(|op| (op.name(), op.paths())).collect();
	assert_eq!(ops, vec![("modify", vec!["q.txt"])]);
}

#[tokio::test]
async fn test_rename_and_delete_prune_directories() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	write(server.path(), "old/name.txt", b"moved content");
	write(server.path(), "gone/deep/file", b"bye");
	write(server.path(), "keep.txt", b"keep");
	let engine = engine(server.path()).await;

	let pulled = client::pull(&engine, "main", client_dir.path()).await.unwrap();
	assert_eq!(pulled.applied, 3);
	let baseline = pulled.manifest;

	fs::create_dir_all(client_dir.path().join("new")).unwrap();
	fs::rename(client_dir.path().join("old/name.txt"), client_dir.path().join("new/name.txt")).unwrap();
	fs::remove_dir_all(client_dir.path().join("old")).unwrap();
	fs::remove_dir_all(client_dir.path().join("gone")).unwrap();

	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert!(report.plan.needed.is_empty(), "a rename needs no upload");
	assert!(report
		.plan
		.changes
		.iter()
		.any(|op| matches!(op, ChangeOp::Rename { from, to, .. } if from == "old/name.txt" && to == "new/name.txt")));

	assert_eq!(fs::read(server.path().join("new/name.txt")).unwrap(), b"moved content");
	assert!(!server.path().join("old").exists());
	assert!(!server.path().join("gone").exists());
	assert!(server.path().join("keep.txt").exists());
}

#[tokio::test]
async fn test_file_replaces_directory() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	write(server.path(), "thing/inner.txt", b"inner");
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	write(client_dir.path(), "thing", b"now a file");
	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert!(report.plan.conflicts.is_empty());
	assert_eq!(fs::read(server.path().join("thing")).unwrap(), b"now a file");

	let live = engine.get_manifest("main").await.unwrap();
	assert_eq!(live.len(), 1);
	assert!(live.get("thing/inner.txt").is_none());
}

#[tokio::test]
async fn test_add_below_live_file_is_type_mismatch() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	write(server.path(), "x", b"server file");
	engine.repository("main").unwrap().rescan().await.unwrap();

	write(client_dir.path(), "x/y", b"client nested");
	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert_eq!(report.plan.conflicts.len(), 1);
	assert_eq!(report.plan.conflicts[0].kind, ConflictType::TypeMismatch);
	assert_eq!(fs::read(server.path().join("x")).unwrap(), b"server file");
}

#[tokio::test]
async fn test_converged_paths_are_skipped() {
	let server = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
	for root in [server.path(), client_dir.path()] {
		write(root, "same.txt", b"identical");
		filetime::set_file_mtime(root.join("same.txt"), mtime).unwrap();
	}
	engine.repository("main").unwrap().rescan().await.unwrap();

	let report = client::push(&engine, "main", client_dir.path(), &baseline).await.unwrap();
	assert!(report.plan.conflicts.is_empty());
	assert!(report.plan.needed.is_empty());
	assert!(report.plan.changes.is_empty());
	assert_eq!(report.plan.converged, vec!["same.txt".to_string()]);
	assert_eq!(report.outcome.applied, 0);
	assert_eq!(report.outcome.revision, 0);
}

#[tokio::test]
async fn test_pull_then_push_round_trip() {
	let server = TempDir::new().unwrap();
	let alice = TempDir::new().unwrap();
	let bob = TempDir::new().unwrap();
	write(server.path(), "shared/notes.md", b"# notes\n");
	std::os::unix::fs::symlink("shared/notes.md", server.path().join("latest")).unwrap();
	let engine = engine(server.path()).await;

	let alice_base = client::pull(&engine, "main", alice.path()).await.unwrap().manifest;
	assert_eq!(fs::read_link(alice.path().join("latest")).unwrap(), Path::new("shared/notes.md"));

	write(alice.path(), "shared/notes.md", b"# notes\nmore\n");
	let pushed = client::push(&engine, "main", alice.path(), &alice_base).await.unwrap();
	assert_eq!(pushed.outcome.revision, 1);

	let bob_pull = client::pull(&engine, "main", bob.path()).await.unwrap();
	assert_eq!(fs::read(bob.path().join("shared/notes.md")).unwrap(), b"# notes\nmore\n");
	assert_eq!(bob_pull.manifest, engine.get_manifest("main").await.unwrap());

	// Nothing left to do
	let again = client::pull(&engine, "main", bob.path()).await.unwrap();
	assert_eq!(again.applied, 0);
	assert_eq!(again.transfer.chunks_sent, 0);
}

#[tokio::test]
async fn test_disjoint_transactions_commit_in_turn() {
	let server = TempDir::new().unwrap();
	let engine = engine(server.path()).await;
	let baseline = engine.get_manifest("main").await.unwrap();

	let mut first = Manifest::new();
	first.insert("one.txt", reposync::Entry::file(ContentHash::of(b"1"), 1, 0o644, 1_600_000_000));
	let mut second = Manifest::new();
	second.insert("two.txt", reposync::Entry::file(ContentHash::of(b"2"), 1, 0o644, 1_600_000_000));

	let plan_a = engine.begin_sync("main", baseline.clone(), first).await.unwrap();
	let plan_b = engine.begin_sync("main", baseline, second).await.unwrap();
	let (hash_a, hash_b) = (ContentHash::of(b"1"), ContentHash::of(b"2"));
	let (ack_a, ack_b) = tokio::join!(
		engine.put_chunk(plan_a.transaction_id, &hash_a, 0, b"1"),
		engine.put_chunk(plan_b.transaction_id, &hash_b, 0, b"2"),
	);
	assert!(ack_a.unwrap().complete);
	assert!(ack_b.unwrap().complete);

	let (commit_a, commit_b) =
		tokio::join!(engine.commit_sync(plan_a.transaction_id, None), engine.commit_sync(plan_b.transaction_id, None));
	let mut revisions = vec![commit_a.unwrap().revision, commit_b.unwrap().revision];
	revisions.sort();
	assert_eq!(revisions, vec![1, 2]);
	assert!(server.path().join("one.txt").exists());
	assert!(server.path().join("two.txt").exists());
}
