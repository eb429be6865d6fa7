//! `filoco mdsync`

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;

use filoco_core::DebugFlags;
use filoco_store::Store;
use filoco_sync::{sync_listen, sync_local_dir, sync_stdio, sync_tcp};

/// Reconcile metadata with a peer store
#[derive(Debug, Args)]
pub struct MdSyncCommand {
    /// The local store directory
    store: PathBuf,

    /// Peer: `-` for stdio, `host:port` for TCP, or a local store
    /// directory
    target: Option<String>,

    /// Listen on a TCP port instead of connecting out
    #[arg(long, conflicts_with = "target")]
    listen: Option<u16>,
}

impl MdSyncCommand {
    pub async fn execute(self) -> Result<()> {
        let flags = DebugFlags::from_env();
        let (store, rel) = Store::find(&self.store, flags).context("locating the store")?;
        if !rel.as_os_str().is_empty() {
            bail!(
                "metadata sync runs on a whole store ({}), not a subtree",
                store.root_path().display()
            );
        }

        if let Some(port) = self.listen {
            sync_listen(&store, port, flags).await?;
            return Ok(());
        }

        let Some(target) = self.target else {
            bail!("a TARGET or --listen PORT is required");
        };

        let stats = if target == "-" {
            sync_stdio(&store, flags).await?
        } else if Path::new(&target).is_dir() {
            let (stats, _) = sync_local_dir(&store, Path::new(&target), flags).await?;
            stats
        } else {
            sync_tcp(&store, &target, flags).await?
        };
        println!(
            "sent {} received {} in {} rounds",
            stats.sent, stats.received, stats.rounds
        );
        Ok(())
    }
}
