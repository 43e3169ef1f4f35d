use clap::{Arg, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reposync::config::{ServerConfig, DEFAULT_DATA_DIR_NAME};
use reposync::engine::SyncEngine;
use reposync::exclusion::ExclusionEngine;
use reposync::logging::{self, *};
use reposync::manifest::ManifestBuilder;

/// Open only `repo` out of the configuration file at `config`
async fn open_repository(config: &str, repo: &str) -> Result<SyncEngine, Box<dyn Error>> {
	let mut server = ServerConfig::load(Path::new(config))?;
	let repository = server
		.repositories
		.remove(repo)
		.ok_or_else(|| format!("{}: no repository named {:?}", config, repo))?;
	Ok(SyncEngine::open(ServerConfig::default().with_repository(repo, repository)).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();

	let matches = Command::new("reposync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Transactional directory tree sync engine (operator tools)")
		.subcommand_required(true)
		.subcommand(
			Command::new("manifest")
				.about("Print the manifest of a directory as JSON")
				.arg(Arg::new("dir").required(true)),
		)
		.subcommand(
			Command::new("gc")
				.about("Remove unreferenced blobs from a repository's store")
				.arg(Arg::new("config").required(true))
				.arg(Arg::new("repo").required(true)),
		)
		.subcommand(
			Command::new("history")
				.about("List the commits of a repository")
				.arg(Arg::new("config").required(true))
				.arg(Arg::new("repo").required(true)),
		)
		.subcommand(
			Command::new("changes")
				.about("List the operations one revision applied")
				.arg(Arg::new("config").required(true))
				.arg(Arg::new("repo").required(true))
				.arg(Arg::new("revision").required(true).value_parser(clap::value_parser!(u64))),
		)
		.get_matches();

	match matches.subcommand() {
		Some(("manifest", sub)) => {
			let dir = sub.get_one::<String>("dir").ok_or("manifest: directory argument required")?;
			let exclusion = Arc::new(ExclusionEngine::reserved_only(DEFAULT_DATA_DIR_NAME)?);
			let manifest =
				ManifestBuilder::new(PathBuf::from(dir)).with_exclusion(exclusion).build_async().await?;
			let errors = manifest.errors().count();
			if errors > 0 {
				warn!("{} paths could not be read", errors);
			}
			println!("{}", String::from_utf8(manifest.to_json()?)?);
		}
		Some(("gc", sub)) => {
			let config = sub.get_one::<String>("config").ok_or("gc: config argument required")?;
			let repo = sub.get_one::<String>("repo").ok_or("gc: repository argument required")?;
			let engine = open_repository(config, repo).await?;
			let report = engine.collect_garbage(repo).await?;
			println!(
				"removed {} blobs ({} bytes), retained {}",
				report.removed, report.bytes_freed, report.retained
			);
			engine.close().await?;
		}
		Some(("history", sub)) => {
			let config = sub.get_one::<String>("config").ok_or("history: config argument required")?;
			let repo = sub.get_one::<String>("repo").ok_or("history: repository argument required")?;
			let engine = open_repository(config, repo).await?;
			for record in engine.list_history(repo).await? {
				println!(
					"r{}\t{}\t{}\t+{} ~{} -{} >{} m{}\t{}",
					record.revision,
					record.timestamp,
					record.transaction,
					record.added,
					record.modified,
					record.deleted,
					record.renamed,
					record.metadata_updated,
					record.message.as_deref().unwrap_or("")
				);
			}
			engine.close().await?;
		}
		Some(("changes", sub)) => {
			let config = sub.get_one::<String>("config").ok_or("changes: config argument required")?;
			let repo = sub.get_one::<String>("repo").ok_or("changes: repository argument required")?;
			let revision = *sub.get_one::<u64>("revision").ok_or("changes: revision argument required")?;
			let engine = open_repository(config, repo).await?;
			for op in engine.list_changes(repo, revision).await?.iter() {
				println!("{}\t{}", op.name(), op.paths().join(" -> "));
			}
			engine.close().await?;
		}
		_ => unreachable!("subcommand_required"),
	}

	Ok(())
}

// vim: ts=4
