//! filoco - peer-to-peer filesystem metadata synchronizer
//!
//! Thin wrappers around the core crates:
//! - `init` - materialize a new store
//! - `info` - inspect an object's metadata records
//! - `scan` - run the scanner, one-shot or watching
//! - `mdsync` - reconcile metadata with a peer
//! - `mdapply` - apply received metadata to the filesystem
//!
//! Exit codes: 0 success, 1 generic error, 2 argument error, 3 store not
//! found.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::info::InfoCommand;
use commands::init::InitCommand;
use commands::mdapply::MdApplyCommand;
use commands::mdsync::MdSyncCommand;
use commands::scan::ScanCommand;
use filoco_store::StoreError;

#[derive(Debug, Parser)]
#[command(name = "filoco", version, about = "Peer-to-peer filesystem metadata synchronizer")]
struct Cli {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new empty store
    Init(InitCommand),
    /// Print the metadata records behind a file or syncable id
    Info(InfoCommand),
    /// Scan a store for filesystem changes
    Scan(ScanCommand),
    /// Reconcile metadata with a peer store
    Mdsync(MdSyncCommand),
    /// Apply received metadata to the local filesystem
    Mdapply(MdApplyCommand),
}

fn setup_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    // Per-process prefix for log correlation across spawned peers.
    let prefix = std::env::var("FILOCO_LOGPREFIX").ok();
    let span = prefix.map(|p| tracing::info_span!("filoco", prefix = %p));
    let _guard = span.as_ref().map(|s| s.enter());

    let result = match cli.command {
        Commands::Init(cmd) => cmd.execute().await,
        Commands::Info(cmd) => cmd.execute().await,
        Commands::Scan(cmd) => cmd.execute().await,
        Commands::Mdsync(cmd) => cmd.execute().await,
        Commands::Mdapply(cmd) => cmd.execute().await,
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("filoco: error: {err:#}");
            let code = if err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))))
            {
                3
            } else {
                1
            };
            std::process::exit(code);
        }
    }
}
