//! `filoco init`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use filoco_core::DebugFlags;
use filoco_store::{Store, SyncMode};

/// Create a new empty store
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Directory to become the store root (default: current directory)
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Human-readable store name
    #[arg(short, long)]
    name: Option<String>,

    /// Use synctree reconciliation instead of serial
    #[arg(long)]
    synctree: bool,
}

impl InitCommand {
    pub async fn execute(self) -> Result<()> {
        let mode = if self.synctree {
            SyncMode::Synctree
        } else {
            SyncMode::Serial
        };
        let store = Store::initialize(
            &self.dir,
            self.name.as_deref(),
            mode,
            DebugFlags::from_env(),
        )
        .with_context(|| format!("initializing store at '{}'", self.dir.display()))?;
        println!("{}", store.store_id());
        Ok(())
    }
}
