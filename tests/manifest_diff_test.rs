//! Manifest builds and diff properties on real trees
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use reposync::diff::{diff, ChangeOp};
use reposync::exclusion::ExclusionEngine;
use reposync::manifest::ManifestBuilder;
use reposync::{EntryKind, Manifest, RepositoryConfig};

fn write(root: &Path, path: &str, data: &[u8]) {
	let full = root.join(path);
	fs::create_dir_all(full.parent().unwrap()).unwrap();
	fs::write(full, data).unwrap();
}

fn build(root: &Path) -> Manifest {
	ManifestBuilder::new(root).build().unwrap()
}

fn populate(root: &Path) {
	write(root, "README.md", b"readme");
	write(root, "src/main.rs", b"fn main() {}");
	write(root, "src/lib.rs", b"pub mod a;");
	write(root, "assets/logo.svg", b"<svg/>");
	std::os::unix::fs::symlink("README.md", root.join("docs")).unwrap();
}

#[test]
fn test_diff_of_identical_builds_is_empty() {
	let tree = TempDir::new().unwrap();
	populate(tree.path());
	let a = build(tree.path());
	let b = build(tree.path());
	assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
	assert!(diff(&a, &b).is_empty());
}

#[test]
fn test_diff_applies_back_to_target() {
	let before_dir = TempDir::new().unwrap();
	let after_dir = TempDir::new().unwrap();
	populate(before_dir.path());
	populate(after_dir.path());

	// Edit, delete, add, move
	write(after_dir.path(), "README.md", b"readme v2");
	fs::remove_file(after_dir.path().join("src/lib.rs")).unwrap();
	write(after_dir.path(), "CHANGELOG.md", b"changes");
	fs::create_dir_all(after_dir.path().join("static")).unwrap();
	fs::rename(after_dir.path().join("assets/logo.svg"), after_dir.path().join("static/logo.svg")).unwrap();

	let a = build(before_dir.path());
	let b = build(after_dir.path());
	let changes = diff(&a, &b);
	let applied = changes.apply_to(&a);

	// mtimes differ between the two trees, so compare content identity
	let identity = |m: &Manifest| -> Vec<(String, Option<reposync::ContentHash>)> {
		m.iter().map(|(p, e)| (p.clone(), e.hash)).collect()
	};
	assert_eq!(identity(&applied), identity(&b));
	assert!(diff(&applied, &b).iter().all(|op| matches!(op, ChangeOp::MetadataUpdate { .. })));
	assert!(changes.iter().any(|op| matches!(op, ChangeOp::Delete { path } if path == "src/lib.rs")));
}

#[test]
fn test_exclusions_and_ignore_file() {
	let tree = TempDir::new().unwrap();
	populate(tree.path());
	write(tree.path(), "build/out.o", b"obj");
	write(tree.path(), "notes.tmp", b"tmp");
	write(tree.path(), "logs/app.log", b"log");
	write(tree.path(), ".syncignore", b"logs/\n");
	write(tree.path(), ".reposync/objects/ab/cdef", b"blob");

	let mut config = RepositoryConfig::new(tree.path());
	config.exclude_patterns = vec!["*.tmp".to_string(), "build/**".to_string()];
	let engine = Arc::new(ExclusionEngine::from_config(&config).unwrap());
	let manifest = ManifestBuilder::new(tree.path()).with_exclusion(engine).build().unwrap();

	let paths: Vec<&str> = manifest.iter().map(|(p, _)| p.as_str()).collect();
	assert_eq!(
		paths,
		vec![".syncignore", "README.md", "assets/logo.svg", "docs", "src/lib.rs", "src/main.rs"]
	);
	assert_eq!(manifest.get("docs").unwrap().kind, EntryKind::Symlink);
}

#[test]
fn test_manifest_json_round_trip() {
	let tree = TempDir::new().unwrap();
	populate(tree.path());
	let manifest = build(tree.path());
	let json = manifest.to_json().unwrap();
	assert_eq!(Manifest::from_json(&json).unwrap(), manifest);
}
