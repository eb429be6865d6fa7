//! `filoco mdapply`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use filoco_apply::MdApply;
use filoco_core::DebugFlags;
use filoco_store::Store;

/// Apply received metadata to the local filesystem
#[derive(Debug, Args)]
pub struct MdApplyCommand {
    /// The store directory
    store: PathBuf,

    /// Revisit every FOB, not only those with pending updates
    #[arg(short, long)]
    force: bool,
}

impl MdApplyCommand {
    pub async fn execute(self) -> Result<()> {
        let flags = DebugFlags::from_env();
        let (store, rel) = Store::find(&self.store, flags).context("locating the store")?;
        if !rel.as_os_str().is_empty() {
            bail!(
                "metadata apply runs on a whole store ({}), not a subtree",
                store.root_path().display()
            );
        }
        let mut applier = MdApply::new(&store, flags).context("starting applier")?;
        applier.run(self.force).await?;
        Ok(())
    }
}
