//! `filoco scan`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use filoco_core::DebugFlags;
use filoco_scan::{run_scanner, InitScan, ScanOptions, Scanner, WatchMode};
use filoco_store::Store;

/// Scan a store for filesystem changes
#[derive(Debug, Args)]
pub struct ScanCommand {
    /// Directory inside the store to start from
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Watch mode: none, inotify or fanotify
    #[arg(short, long, default_value = "none")]
    watch: WatchMode,

    /// Rescan all directories even in watch mode
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Continue an interrupted scan (skip already up-to-date directories)
    #[arg(short = 'c', long = "continue")]
    continue_pending: bool,

    /// Walk every subdirectory instead of trusting recorded scan states
    #[arg(short, long)]
    recursive: bool,
}

impl ScanCommand {
    pub async fn execute(self) -> Result<()> {
        let flags = DebugFlags::from_env();
        let (store, start_path) =
            Store::find(&self.dir, flags).context("locating the enclosing store")?;

        // Without a watcher a full pass is the only useful default; with
        // one, continuing pending work suffices.
        let init_scan = if self.continue_pending {
            InitScan::Pending
        } else if self.all || self.watch == WatchMode::None {
            InitScan::All
        } else {
            InitScan::Pending
        };
        let opts = ScanOptions {
            init_scan,
            recursive: self.recursive,
            start_path,
        };
        let mut scanner = Scanner::new(&store, opts, flags).context("starting scanner")?;
        run_scanner(&mut scanner, self.watch).await?;
        Ok(())
    }
}
