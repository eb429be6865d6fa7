//! On-disk store layout, discovery and initialization
//!
//! A store is a directory tree whose root carries a `.filoco/`
//! subdirectory with the store metadata:
//!
//! ```text
//! .filoco/
//!   version          integer text, currently "1"
//!   type             "fs"
//!   sync_mode        "serial" or "synctree"
//!   store_id         64 hex chars, the certificate fingerprint
//!   meta.sqlite      metadata database (WAL mode)
//!   placeholder-tmp/ staging area for the metadata applier
//! ```
//!
//! Discovery walks upward from a starting directory until it finds
//! `.filoco`, like `git` does, refusing to cross mount boundaries (stores
//! never span more than one filesystem).

use std::fs;
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use filoco_core::{DebugFlags, StoreId};

use crate::db::Db;
use crate::error::{Result, StoreError};
use crate::fhandle::{self, FileHandle};

/// Name of the metadata directory at the store root
pub const META_DIR: &str = ".filoco";

/// Staging subdirectory for placeholder inodes
pub const PLACEHOLDER_DIR: &str = "placeholder-tmp";

/// Symlink target used for regular-file placeholders
pub const PLACEHOLDER_TARGET: &str = "/!/filoco-missing";

/// The store layout version this build writes and understands
pub const LAYOUT_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("schema.sql");

/// Reconciliation strategy fixed at store initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Exchange per-origin max serials, then stream the gaps
    Serial,
    /// XOR-folded prefix-tree descent
    Synctree,
}

impl SyncMode {
    /// On-disk tag of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Serial => "serial",
            SyncMode::Synctree => "synctree",
        }
    }

    /// Parses the on-disk tag
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "serial" => Ok(SyncMode::Serial),
            "synctree" => Ok(SyncMode::Synctree),
            other => Err(StoreError::Corrupt(format!("unknown sync_mode: {other}"))),
        }
    }
}

/// An opened Filoco store
pub struct Store {
    root_path: PathBuf,
    root_fd: OwnedFd,
    meta_fd: OwnedFd,
    root_mnt: i32,
    store_id: StoreId,
    sync_mode: SyncMode,
    owner: (u32, u32),
    db: Db,
}

impl Store {
    /// Opens the store rooted at `root` (which must contain `.filoco`)
    pub fn open(root: &Path, flags: DebugFlags) -> Result<Store> {
        let root_path = root.canonicalize()?;
        let meta_path = root_path.join(META_DIR);
        if !meta_path.is_dir() {
            return Err(StoreError::NotFound(root_path));
        }
        let root_fd = open_dir(&root_path)?;
        let meta_fd = open_dir(&meta_path)?;
        let (_, root_mnt) = fhandle::handle_of_fd(root_fd.as_fd())?;

        let version = read_meta_file(&meta_path, "version")?;
        let version: u32 = version
            .trim()
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad version: {version}")))?;
        if version != LAYOUT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version {version}"
            )));
        }
        let store_id = StoreId::from_hex(&read_meta_file(&meta_path, "store_id")?)?;
        let sync_mode = SyncMode::parse(&read_meta_file(&meta_path, "sync_mode")?)?;

        let st = fs::metadata(&root_path)?;
        let owner = (st.uid(), st.gid());

        let db = Db::open(&meta_path.join("meta.sqlite"), flags)?;

        debug!(root = %root_path.display(), store_id = %store_id, ?sync_mode, "Opened store");
        Ok(Store {
            root_path,
            root_fd,
            meta_fd,
            root_mnt,
            store_id,
            sync_mode,
            owner,
            db,
        })
    }

    /// Finds the store containing `dir`
    ///
    /// Walks up from `dir` until a directory with a `.filoco` subdirectory
    /// appears, stopping at mount boundaries. Returns the store and the
    /// path of `dir` relative to the store root.
    pub fn find(dir: &Path, flags: DebugFlags) -> Result<(Store, PathBuf)> {
        let start = dir.canonicalize().map_err(|_| StoreError::NotFound(dir.to_path_buf()))?;
        let start_dev = fs::metadata(&start)?.dev();
        let mut cur = start.clone();
        loop {
            if cur.join(META_DIR).is_dir() {
                let store = Store::open(&cur, flags)?;
                let rel = start
                    .strip_prefix(&cur)
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                return Ok((store, rel));
            }
            let Some(parent) = cur.parent() else {
                // Hit the filesystem root.
                return Err(StoreError::NotFound(dir.to_path_buf()));
            };
            // Stores do not span mounts, so a device change means we can
            // stop looking.
            if fs::metadata(parent)?.dev() != start_dev {
                return Err(StoreError::NotFound(dir.to_path_buf()));
            }
            cur = parent.to_path_buf();
        }
    }

    /// Creates a new empty store rooted at `dir`
    ///
    /// The layout is assembled under `.filoco.tmp` and renamed into place
    /// so a crashed init never leaves a half-built store behind.
    pub fn initialize(
        dir: &Path,
        name: Option<&str>,
        sync_mode: SyncMode,
        flags: DebugFlags,
    ) -> Result<Store> {
        let root = dir.canonicalize()?;
        if let Ok((existing, _)) = Store::find(&root, flags) {
            return Err(StoreError::AlreadyInStore {
                dir: root,
                root: existing.root_path,
            });
        }

        let tmp = root.join(".filoco.tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        let build = || -> Result<StoreId> {
            fs::create_dir(&tmp)?;
            let store_id = generate_store_id();
            write_meta_file(&tmp, "version", &format!("{LAYOUT_VERSION}\n"))?;
            write_meta_file(&tmp, "type", "fs\n")?;
            write_meta_file(&tmp, "sync_mode", &format!("{}\n", sync_mode.as_str()))?;
            write_meta_file(&tmp, "store_id", &format!("{}\n", store_id.to_hex()))?;
            if let Some(name) = name {
                write_meta_file(&tmp, "name", &format!("{name}\n"))?;
            }
            fs::create_dir(tmp.join(PLACEHOLDER_DIR))?;

            let db = Db::open(&tmp.join("meta.sqlite"), flags)?;
            db.create_schema(SCHEMA)?;
            db.conn().execute(
                "INSERT INTO stores (store_id, self) VALUES (?1, 1)",
                [store_id.to_hex()],
            )?;
            drop(db);
            Ok(store_id)
        };
        let store_id = match build() {
            Ok(id) => id,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(e);
            }
        };
        fs::rename(&tmp, root.join(META_DIR))?;
        info!(root = %root.display(), store_id = %store_id, mode = sync_mode.as_str(), "Initialized store");
        Store::open(&root, flags)
    }

    /// Absolute path of the store root
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Absolute path of the metadata directory
    pub fn meta_path(&self) -> PathBuf {
        self.root_path.join(META_DIR)
    }

    /// Absolute path of the placeholder staging directory
    pub fn placeholder_path(&self) -> PathBuf {
        self.meta_path().join(PLACEHOLDER_DIR)
    }

    /// Open descriptor on the store root directory
    pub fn root_fd(&self) -> BorrowedFd<'_> {
        self.root_fd.as_fd()
    }

    /// Open descriptor on the metadata directory
    pub fn meta_fd(&self) -> BorrowedFd<'_> {
        self.meta_fd.as_fd()
    }

    /// Mount id of the store root; entries on other mounts are skipped
    pub fn root_mnt(&self) -> i32 {
        self.root_mnt
    }

    /// This store's identity fingerprint
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// The reconciliation mode fixed at init
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// uid/gid owning the store root; placeholders are chowned to this
    pub fn owner(&self) -> (u32, u32) {
        self.owner
    }

    /// The metadata database
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Opens an inode from its stable handle, relative to this store's mount
    pub fn open_handle(&self, handle: &FileHandle, flags: OFlag) -> Result<OwnedFd> {
        fhandle::open_by_handle(self.root_fd.as_fd(), handle, flags.bits())
    }

    /// Checks whether a handle still resolves to a live inode
    ///
    /// A probe the process lacks privileges for counts as "exists": we
    /// cannot disprove it, and the callers only use a definite `false` to
    /// discard records.
    pub fn handle_exists(&self, handle: &FileHandle) -> bool {
        match self.open_handle(handle, OFlag::O_PATH) {
            Ok(_) => true,
            Err(StoreError::Stale) => false,
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root_path)
            .field("store_id", &self.store_id)
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}

fn open_dir(path: &Path) -> Result<OwnedFd> {
    let fd = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| StoreError::Io(e.into()))?;
    Ok(fd)
}

fn read_meta_file(meta_path: &Path, name: &str) -> Result<String> {
    fs::read_to_string(meta_path.join(name))
        .map_err(|_| StoreError::Corrupt(format!("missing {META_DIR}/{name}")))
        .map(|s| s.trim().to_string())
}

fn write_meta_file(dir: &Path, name: &str, content: &str) -> Result<()> {
    let path = dir.join(name);
    let mut file = fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    // Metadata files are world-readable; secrets get tighter modes from
    // the identity tooling that writes them.
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Generates a fresh 256-bit store fingerprint
fn generate_store_id() -> StoreId {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&digest);
    StoreId::from_bytes(raw)
}
