//! Debug-category flags
//!
//! `FILOCO_DBG` holds a comma-separated list of categories that enable
//! extra high-volume trace output (`queue`, `scan`, `mdupdate`,
//! `synctree`, `dbw`, `fd`). The flags are read once at startup and
//! passed around explicitly rather than consulted from a global.

/// Per-category debug switches parsed from `FILOCO_DBG`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    /// Scan-queue pushes and pops
    pub queue: bool,
    /// Individual directory scans and rechecks
    pub scan: bool,
    /// Metadata updates derived from link events
    pub mdupdate: bool,
    /// Synctree level exchanges during reconciliation
    pub synctree: bool,
    /// Every write statement issued to the database
    pub dbw: bool,
    /// Descriptor open/close tracking
    pub fd: bool,
}

impl DebugFlags {
    /// Parses a comma-separated category list
    pub fn from_list(list: &str) -> Self {
        let mut flags = DebugFlags::default();
        for cat in list.split(',') {
            match cat.trim() {
                "queue" => flags.queue = true,
                "scan" => flags.scan = true,
                "mdupdate" => flags.mdupdate = true,
                "synctree" => flags.synctree = true,
                "dbw" => flags.dbw = true,
                "fd" => flags.fd = true,
                "" => {}
                other => tracing::warn!(category = other, "Unknown FILOCO_DBG category"),
            }
        }
        flags
    }

    /// Reads the flags from the `FILOCO_DBG` environment variable
    pub fn from_env() -> Self {
        match std::env::var("FILOCO_DBG") {
            Ok(list) => Self::from_list(&list),
            Err(_) => DebugFlags::default(),
        }
    }
}
