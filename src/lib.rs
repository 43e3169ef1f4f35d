//! # reposync - transactional directory tree synchronization
//!
//! A server-side engine that reconciles a directory tree with remote copies.
//! Clients send a baseline (what they last synced) and a target (what they
//! have now); the engine diffs them, checks every touched path against the
//! live tree, receives the missing blobs in resumable chunks and swaps the
//! accepted changes in atomically behind a commit journal.
//!
//! ```rust,ignore
//! use reposync::config::{RepositoryConfig, ServerConfig};
//! use reposync::engine::SyncEngine;
//!
//! let config = ServerConfig::default().with_repository("main", RepositoryConfig::new("/srv/main"));
//! let engine = SyncEngine::open(config).await?;
//! let report = reposync::client::push(&engine, "main", "./tree".as_ref(), &baseline).await?;
//! println!("now at revision {}", report.outcome.revision);
//! ```

pub mod chunk_tracker;
pub mod client;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod error;
pub mod exclusion;
pub mod journal;
pub mod logging;
pub mod manifest;
pub mod protocol;
pub mod repository;
pub mod state;
pub mod store;
pub mod transaction;
pub mod transfer;
pub mod types;
pub mod util;
pub mod validation;

pub use config::{RepositoryConfig, ServerConfig};
pub use engine::SyncEngine;
pub use error::{StateError, StoreError, SyncError};
pub use manifest::Manifest;
pub use types::{ContentHash, Entry, EntryKind};

// vim: ts=4
