//! `filoco info`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use filoco_core::{DebugFlags, Id128, Kind, SyncableBody};
use filoco_scan::InodeInfo;
use filoco_store::{Store, StoredSyncable};

/// Print the metadata records behind a file or syncable id
#[derive(Debug, Args)]
pub struct InfoCommand {
    /// A file inside a store, or (with ID) a store directory
    target: PathBuf,

    /// A syncable id in hex; makes TARGET a store directory
    id: Option<String>,

    /// Print the location-version DAG as GraphViz
    #[arg(long, conflicts_with = "fcv_graph")]
    flv_graph: bool,

    /// Print the content-version DAG as GraphViz
    #[arg(long)]
    fcv_graph: bool,
}

impl InfoCommand {
    pub async fn execute(self) -> Result<()> {
        let flags = DebugFlags::from_env();
        if let Some(ref id_hex) = self.id {
            let store = Store::open(&self.target, flags).context("opening the store")?;
            let id = Id128::from_hex(id_hex).context("parsing the syncable id")?;
            if self.flv_graph {
                print_graph(&store, &id, Kind::Flv, None)?;
            } else if self.fcv_graph {
                print_graph(&store, &id, Kind::Fcv, None)?;
            } else {
                print_syncable(&store, &id, 0, false)?;
            }
            return Ok(());
        }

        let (store, rel) = Store::find(&self.target, flags).context("locating the store")?;
        if rel.as_os_str().is_empty() {
            bail!("'{}' is a store root, not a file in one", self.target.display());
        }
        let mut info = InodeInfo::open_at(store.root_fd(), rel.as_os_str())
            .with_context(|| format!("opening '{}'", rel.display()))?;
        let st = info.get_stat(&store, true)?;
        let inode = store.inode_by_ino(st.st_ino)?;

        if self.flv_graph || self.fcv_graph {
            let Some(row) = inode else {
                bail!("no inode record for '{}', run a scan first", rel.display());
            };
            let Some(fob) = row.fob else {
                bail!("'{}' has no file object yet", rel.display());
            };
            let kind = if self.flv_graph { Kind::Flv } else { Kind::Fcv };
            let current = if self.flv_graph { row.flv } else { row.fcv };
            print_graph(&store, &fob, kind, current)?;
            return Ok(());
        }

        println!("Store root:   {}", store.root_path().display());
        println!("Inode number: {}", st.st_ino);
        let handle = info.get_handle()?;
        println!(
            "File handle:  {}:{}",
            handle.handle_type,
            hex::encode(&handle.bytes)
        );
        let Some(row) = inode else {
            println!("No inode record (not scanned yet)");
            return Ok(());
        };
        println!(
            "DB handle:    {}:{}",
            row.handle.handle_type,
            hex::encode(&row.handle.bytes)
        );
        println!("Stat tuple:   ({}, {})", st.st_size, st.st_mtime);
        println!(
            "DB tuple:     ({}, {})",
            row.size.unwrap_or(-1),
            row.mtime.map(|ns| ns / 1_000_000_000).unwrap_or(-1)
        );
        println!("Type:         {}", row.ftype.as_char());
        println!("IID:          {}", row.iid);
        print_assignment(&store, "FOB", row.fob.as_ref())?;
        print_assignment(&store, "FLV", row.flv.as_ref())?;
        print_assignment(&store, "FCV", row.fcv.as_ref())?;
        Ok(())
    }
}

fn print_assignment(store: &Store, label: &str, id: Option<&Id128>) -> Result<()> {
    match id {
        Some(id) => {
            println!("{label}:          {id}");
            print_syncable(store, id, 4, true)?;
        }
        None => println!("{label}:          -"),
    }
    Ok(())
}

fn print_syncable(store: &Store, id: &Id128, indent: usize, skip_kind: bool) -> Result<()> {
    let pad = " ".repeat(indent);
    let Some(stored) = store.get_syncable(id)? else {
        println!("{pad}(no syncable with id {id})");
        return Ok(());
    };
    let StoredSyncable {
        insert_order,
        created,
        record,
    } = stored;
    if !skip_kind {
        println!("{pad}Kind:         {}", record.body.kind().as_str());
    }
    println!("{pad}Origin:       {}", record.origin);
    println!("{pad}Serial:       {}", record.serial);
    println!("{pad}Insert order: {insert_order}");
    println!("{pad}Created:      {created}");
    match record.body {
        SyncableBody::Fob(fob) => {
            println!("{pad}Type:         {}", fob.ftype.as_char());
        }
        SyncableBody::Flv(flv) => {
            let parent = flv
                .parent_fob
                .map(|p| p.to_hex())
                .unwrap_or_else(|| "(root)".to_string());
            println!("{pad}Location:     {parent}/{}", flv.name);
            println!("{pad}Parent vers:  {}", join_hex(&flv.parent_vers));
        }
        SyncableBody::Fcv(fcv) => {
            let hash = fcv
                .content_hash
                .map(hex::encode)
                .unwrap_or_else(|| "(working)".to_string());
            println!("{pad}Content:      {hash}");
            println!("{pad}Parent vers:  {}", join_hex(&fcv.parent_vers));
        }
    }
    Ok(())
}

fn join_hex(ids: &[Id128]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(Id128::to_hex)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_graph(store: &Store, fob: &Id128, kind: Kind, current: Option<Id128>) -> Result<()> {
    let nodes = store.version_graph(fob, kind)?;
    println!("digraph G {{");
    if let Some(cur) = current {
        println!("  \"{cur}\" [color=red];");
    }
    for node in &nodes {
        let mut label = format!("{} [{}]", node.id, node.label);
        if node.is_head {
            label.push_str(" [head]");
        }
        println!("  \"{}\" [label=\"{label}\"];", node.id);
        for parent in &node.parent_vers {
            println!("  \"{}\" -> \"{parent}\";", node.id);
        }
    }
    println!("}}");
    Ok(())
}
