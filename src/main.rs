mod config;
mod error;
mod migrate;
mod model;
mod providers;
mod util;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use migrate::orchestrator::Migrator;
use migrate::progress::{self, RunReport};
use providers::gitlab::GitLabClient;
use providers::trello::TrelloClient;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "trellab: migrate a Trello board into a GitLab project",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to ~/.trellab/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only process these cards (id or short-link). Repeatable; adds to the config list.
    #[arg(short, long = "include", global = true, value_name = "CARD")]
    include: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate every card, then rewrite cross-links.
    Migrate,
    /// Rewrite @mentions in migrated issues and comments.
    Mentions,
    /// Append custom-field values to migrated issues missing them.
    CustomFields,
    /// Add migration markers to issues matched by title.
    Markers,
    /// Rewrite card links into issue references.
    Links,
    /// Delete every issue numbered above IID.
    DeleteAbove {
        iid: u64,
        /// Required: deletion cannot be undone.
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TRELLAB_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "trellab=debug,info"
        } else {
            "trellab=info,warn"
        })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::DeleteAbove { iid, yes: false } = cli.command {
        bail!("refusing to delete issues above #{iid} without --yes");
    }

    // Configuration problems are fatal before any request goes out.
    let settings = config::load_config(cli.config.as_deref())?.validate(&cli.include)?;
    debug!(
        board = %settings.trello.board_id,
        project = %settings.gitlab.project,
        "configuration loaded"
    );

    let source = Arc::new(TrelloClient::new(&settings.trello));
    let target = Arc::new(GitLabClient::new(&settings.gitlab));

    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(progress::render(rx));

    let migrator = Migrator::new(
        source,
        target,
        settings.migration,
        settings.trello.link_base,
        tx,
    );
    debug!(phase = ?migrator.phase(), command = ?cli.command, "starting run");
    let result = match cli.command {
        Commands::Migrate => migrator.migrate().await,
        Commands::Mentions => migrator.adjust_mentions().await,
        Commands::CustomFields => migrator.backfill_custom_fields().await,
        Commands::Markers => migrator.backfill_markers().await,
        Commands::Links => migrator.rewrite_links().await,
        Commands::DeleteAbove { iid, .. } => migrator.delete_above(iid).await,
    };

    // Every sender is gone once the migrator is consumed.
    let _ = renderer.await;

    let report: RunReport = result?;
    if !report.errors.is_empty() {
        warn!(count = report.errors.len(), "run finished with per-card errors");
    }
    Ok(())
}
