//! The `backhaul` command line tool.

mod cmd;
mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

#[derive(Parser)]
#[command(version, about = "content-addressed encrypted backups", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, value_name = "FILE", default_value = "backhaul.json")]
    config: PathBuf,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save one configured job
    Save {
        /// Job name from the config file
        job: String,
    },
    /// Restore a recorded backup into an existing directory
    Restore {
        /// Backup id, 16 hex digits
        id: String,
        /// Directory to restore into; must exist
        target: PathBuf,
    },
    /// Check that every recorded backup is fully reachable
    Verify {
        /// Load and re-hash file chunks too, not just listings
        #[arg(long)]
        read_files: bool,

        /// Concurrent blob loads
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Remember verified subtrees here and skip them next time
        #[arg(long, value_name = "FILE")]
        structure_file: Option<PathBuf>,
    },
    /// List recorded backups, most recent first
    Jobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)?;

    // Ctrl-C cancels cooperatively: in-flight writes stop, backoff
    // sleeps wake, and the run aborts with a cancellation error.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling");
                cancel.cancel();
            }
        });
    }

    let session = cmd::open_session(&config, cancel).await?;

    match cli.cmd {
        Commands::Save { job } => cmd::save(&config, &job, session).await,
        Commands::Restore { id, target } => {
            let id = u64::from_str_radix(&id, 16)
                .with_context(|| format!("backup id {id:?} must be 16 hex digits"))?;
            cmd::restore(id, &target, session).await
        }
        Commands::Verify {
            read_files,
            concurrency,
            structure_file,
        } => cmd::verify(read_files, concurrency, structure_file.as_deref(), session).await,
        Commands::Jobs => cmd::jobs(session).await,
    }
}
