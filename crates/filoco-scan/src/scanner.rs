//! The scanner engine
//!
//! Turns filesystem state and change notifications into metadata: inode
//! records, link rows and new FOB/FLV/FCV syncables. The engine is
//! deliberately crash-tolerant - every discovery is recorded inside a
//! transaction while an open descriptor pins the inode, so whatever the
//! scanner writes was true at the moment it wrote it.
//!
//! One scanner per store: a non-blocking flock on `.filoco/scan.lock`
//! turns an accidental second instance into a clean startup error.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use filoco_core::{is_longname, shortname, DebugFlags, FobType, Id128, SyncableBody};
use filoco_store::{InodeRow, ScanState, Store, StoreError, ROOT_IID};

use crate::error::{Result, ScanError};
use crate::inode::{stat_tuple, InodeInfo};
use crate::queue::{ScanAction, ScanQueue, ScanRequest};

/// Soft cap on descriptors held by queued scan targets
pub const QUEUE_MAX_FDS: usize = 1000;

/// Seconds to wait before creating a FOB for a notification-discovered
/// inode
///
/// Absorbs the copy-then-rename-over idiom: if the fresh inode replaces
/// an existing FOB within this window it becomes a new version of that
/// FOB instead of a new object.
pub const FOB_CREATE_WAIT: Duration = Duration::from_secs(30);

/// Database operations between cooperative yields
const YIELD_EVERY: usize = 500;

/// How many times one inode may be refilled into the queue per run before
/// it is left for the next run (bounds rescan livelock on racy
/// directories)
const MAX_REFILL_ATTEMPTS: u32 = 3;

/// What to scan at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitScan {
    /// Recheck everything
    All,
    /// Only continue pending (not up-to-date) work
    Pending,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Startup behavior; defaults to `All` without a watcher, `Pending`
    /// with one
    pub init_scan: InitScan,
    /// Walk every subdirectory instead of trusting recorded scan states
    pub recursive: bool,
    /// Subtree to scan, relative to the store root (requires `recursive`)
    pub start_path: PathBuf,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            init_scan: InitScan::All,
            recursive: false,
            start_path: PathBuf::new(),
        }
    }
}

/// A FOB creation deferred by the notification grace window
struct Deferred {
    due: Instant,
    parent_ino: u64,
    name: String,
    iid: String,
}

/// Exclusive advisory lock on `.filoco/scan.lock`
struct ScanLock {
    _file: std::fs::File,
}

impl ScanLock {
    fn acquire(store: &Store) -> Result<ScanLock> {
        let path = store.meta_path().join("scan.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(ScanError::Locked);
            }
            return Err(ScanError::Io(err));
        }
        Ok(ScanLock { _file: file })
    }
}

/// The scanner
pub struct Scanner<'s> {
    store: &'s Store,
    flags: DebugFlags,
    opts: ScanOptions,
    queue: ScanQueue,
    from_notify: bool,
    deferred: Vec<Deferred>,
    refill_attempts: HashMap<String, u32>,
    _lock: ScanLock,
}

impl<'s> Scanner<'s> {
    /// Creates a scanner over an opened store, taking the scan lock
    pub fn new(store: &'s Store, opts: ScanOptions, flags: DebugFlags) -> Result<Scanner<'s>> {
        if !opts.start_path.as_os_str().is_empty() && !opts.recursive {
            return Err(ScanError::NotTracked(
                "scanning a specific subtree requires a recursive scan".into(),
            ));
        }
        let lock = ScanLock::acquire(store)?;
        Ok(Scanner {
            store,
            flags,
            opts,
            queue: ScanQueue::new(QUEUE_MAX_FDS),
            from_notify: false,
            deferred: Vec::new(),
            refill_attempts: HashMap::new(),
            _lock: lock,
        })
    }

    /// The store this scanner works on
    pub fn store(&self) -> &Store {
        self.store
    }

    // ------------------------------------------------------------------
    // Inode records
    // ------------------------------------------------------------------

    /// Ensures the store root has its `ROOT` inode record
    pub fn get_root(&mut self) -> Result<InodeInfo> {
        let fd = nix::unistd::dup(self.store.root_fd())?;
        let mut info = InodeInfo::from_fd(fd);
        self.find_inode(&mut info, true, true)?;
        Ok(info)
    }

    /// Finds the database record for an open inode, creating one if absent
    ///
    /// Matches by inode number; an existing row whose stored handle
    /// neither equals the observed one nor resolves anymore is a leftover
    /// of a deleted inode whose number got recycled, so it is dropped and
    /// replaced. The root record may never be replaced.
    pub fn find_inode(
        &mut self,
        info: &mut InodeInfo,
        is_root: bool,
        create: bool,
    ) -> Result<Option<InodeRow>> {
        info.get_handle()?;
        let ino = info.get_ino(self.store)?;
        let ftype = info.get_type(self.store)?;
        let txn = self.store.db().ensure_transaction()?;

        if let Some(row) = self.store.inode_by_ino(ino)? {
            let same = {
                let observed = info.get_handle()?;
                row.handle == *observed
            };
            if same || self.store.handle_exists(&row.handle) {
                info.iid = Some(row.iid.clone());
                txn.commit()?;
                return Ok(Some(row));
            }
            if is_root || row.iid == ROOT_IID {
                return Err(ScanError::RootReplaced);
            }
            debug!(iid = %row.iid, ino, "Stale inode record replaced");
            self.store.delete_inode(&row.iid)?;
        }

        if !create {
            txn.commit()?;
            return Ok(None);
        }

        let iid = if is_root {
            ROOT_IID.to_string()
        } else {
            Id128::generate().to_hex()
        };
        let st = info.get_stat(self.store, false)?;
        let mtime = st.st_mtime * 1_000_000_000 + st.st_mtime_nsec;
        let ctime = st.st_ctime * 1_000_000_000 + st.st_ctime_nsec;
        let row = InodeRow {
            iid: iid.clone(),
            ino,
            handle: info.get_handle()?.clone(),
            ftype,
            size: Some(st.st_size),
            mtime: Some(mtime),
            ctime: Some(ctime),
            // Birth time approximated by mtime at first observation.
            btime: Some(mtime),
            scan_state: if ftype == FobType::Directory {
                ScanState::NeverScanned
            } else {
                ScanState::UpToDate
            },
            fob: None,
            flv: None,
            fcv: None,
        };
        // Safe without extra locking: the open descriptor pins the inode,
        // so the row we write describes something that still exists.
        self.store.insert_inode(&row)?;
        info.iid = Some(iid);
        if ftype == FobType::Directory {
            self.push_scan(ScanAction::Scan, info.duplicate()?);
        }
        txn.commit()?;
        Ok(Some(row))
    }

    // ------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------

    /// Queues a scan request
    pub fn push_scan(&mut self, action: ScanAction, target: InodeInfo) {
        if self.flags.queue {
            debug!(?action, ino = ?target.ino, "Queueing scan request");
        }
        self.queue.push(action, target);
    }

    /// Refills the queue from inode records not yet up to date
    ///
    /// Returns true if anything was queued. Records that keep coming back
    /// (e.g. a directory mutating on every pass) are retried a bounded
    /// number of times per run and left for the next run after that.
    fn queue_unscanned(&mut self) -> Result<bool> {
        let mut queued = false;
        for row in self.store.unscanned_inodes()? {
            let attempts = self.refill_attempts.entry(row.iid.clone()).or_insert(0);
            if *attempts >= MAX_REFILL_ATTEMPTS {
                continue;
            }
            *attempts += 1;
            self.push_scan(ScanAction::Scan, InodeInfo::from_db(&row));
            queued = true;
        }
        Ok(queued)
    }

    /// Queues a `Check` of every known directory inode
    fn queue_checks(&mut self) -> Result<()> {
        let conn = self.store.db().conn();
        let rows = {
            let mut stmt = conn
                .prepare("SELECT * FROM inodes WHERE type = 'd' ORDER BY ino")
                .map_err(StoreError::from)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>("iid")?,
                        row.get::<_, i64>("ino")? as u64,
                    ))
                })
                .map_err(StoreError::from)?;
            let mut iids = Vec::new();
            for row in mapped {
                iids.push(row.map_err(StoreError::from)?);
            }
            iids
        };
        for (iid, _) in rows {
            if let Some(row) = self.store.inode_by_iid(&iid)? {
                self.push_scan(ScanAction::Check, InodeInfo::from_db(&row));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Rechecks one known inode against its stored stat tuple
    fn check(&mut self, info: &mut InodeInfo) -> Result<()> {
        if self.flags.scan {
            debug!(ino = ?info.ino, "Checking inode");
        }
        let Some(iid) = info.iid.clone() else {
            return Ok(());
        };
        let st = match info.get_stat(self.store, true) {
            Ok(st) => st,
            Err(ScanError::Stale) => {
                self.store.delete_inode(&iid)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(row) = self.store.inode_by_iid(&iid)? else {
            return Ok(());
        };
        let (mtime, ctime, size, _) = stat_tuple(&st);
        let disk = (Some(size), Some(mtime), Some(ctime), ScanState::UpToDate);
        let db = (row.size, row.mtime, row.ctime, row.scan_state);
        if disk != db {
            if self.flags.scan {
                debug!(ino = row.ino, "Change detected, scanning now");
            }
            // The inode is already warm in cache; scan inline rather than
            // requeue.
            self.scan_target(info, true, false)?;
        }
        Ok(())
    }

    /// Scans one target: resolve its record, stat it, and for directories
    /// read the contents
    fn scan_target(&mut self, info: &mut InodeInfo, create: bool, recursive: bool) -> Result<()> {
        let obj = match self.find_inode(info, false, create)? {
            Some(obj) => obj,
            None => return Ok(()),
        };
        match info.get_stat(self.store, true) {
            Ok(_) => {}
            Err(ScanError::Stale) => {
                self.store.delete_inode(&obj.iid)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if info.get_type(self.store)? == FobType::Directory {
            self.scan_dir(info, &obj, recursive)?;
        }
        Ok(())
    }

    /// Reads a directory's entries and reconciles the link rows
    fn scan_dir(&mut self, dirinfo: &mut InodeInfo, dirobj: &InodeRow, recursive: bool) -> Result<()> {
        if self.flags.scan {
            debug!(ino = dirobj.ino, "Scanning directory");
        }
        let st_start = dirinfo.get_stat(self.store, true)?;
        // Keep a private descriptor for the whole pass so renames of the
        // directory itself cannot pull it out from under us.
        let dirfd: OwnedFd = dirinfo.ensure_fd(self.store)?.try_clone_to_owned()?;
        let mut seen: HashSet<String> = HashSet::new();

        let txn = self.store.db().ensure_transaction()?;
        for name in read_entries(dirfd.as_fd())? {
            let Some(name) = name.to_str().map(str::to_owned) else {
                warn!(dir = dirobj.ino, name = ?name, "Invalid UTF-8 name, skipping");
                continue;
            };
            if name == filoco_store::META_DIR {
                continue;
            }
            seen.insert(name.clone());
            if let Err(e) = self.scan_entry(dirfd.as_fd(), dirobj, &name, recursive) {
                match e {
                    ScanError::Stale | ScanError::CrossMount => {}
                    ScanError::Io(err) => {
                        warn!(dir = dirobj.ino, name, error = %err, "Skipping entry");
                    }
                    fatal => return Err(fatal),
                }
            }
        }

        // Entries that were not seen are gone; drop their link rows.
        for link in self.store.links_of_parent(dirobj.ino)? {
            if !seen.contains(&link.name) {
                if self.flags.mdupdate {
                    debug!(dir = dirobj.ino, name = %link.name, "Unlinking");
                }
                self.store.link_delete(link.parent, &link.name)?;
            }
        }

        let st_end = dirinfo.get_stat(self.store, true)?;
        if stat_tuple(&st_start) == stat_tuple(&st_end) {
            let (mtime, ctime, size, _) = stat_tuple(&st_end);
            self.store
                .update_inode_stat(dirobj.ino, size, mtime, ctime, ScanState::UpToDate)?;
        } else {
            // Something mutated the directory mid-scan; leave it marked
            // and let a later queue refill retry instead of looping here.
            warn!(ino = dirobj.ino, "Directory changed during scan, needs rescan");
            self.store.set_scan_state(dirobj.ino, ScanState::NeedsRescan)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Processes one directory entry: open, identify, reconcile its link
    fn scan_entry(
        &mut self,
        dirfd: BorrowedFd<'_>,
        dirobj: &InodeRow,
        name: &str,
        recursive: bool,
    ) -> Result<()> {
        // An O_PATH descriptor guarantees the stat/handle operations below
        // all refer to one inode even if the name is replaced meanwhile.
        let mut info = InodeInfo::open_at(dirfd, std::ffi::OsStr::new(name))?;
        if info.mount_id()? != self.store.root_mnt() {
            return Err(ScanError::CrossMount);
        }
        let Some(mut obj) = self.find_inode(&mut info, false, true)? else {
            return Ok(());
        };

        let old_link = self.store.link_get(dirobj.ino, name)?;
        let link_changed = match &old_link {
            None => {
                self.store.link_insert(dirobj.ino, name, obj.ino)?;
                true
            }
            Some(link) if link.ino != obj.ino => {
                self.store.link_set_ino(dirobj.ino, name, obj.ino)?;
                true
            }
            Some(_) => false,
        };
        if link_changed {
            if self.flags.mdupdate {
                debug!(dir = dirobj.ino, name, ino = obj.ino, "Linking");
            }
            let old_obj = match &old_link {
                Some(link) => self.store.inode_by_ino(link.ino)?,
                None => None,
            };
            self.on_link(dirobj, name, &mut obj, old_obj.as_ref())?;
        }

        if recursive && obj.ftype == FobType::Directory {
            self.push_scan(ScanAction::ScanRecursive, info.duplicate()?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Link-derived metadata
    // ------------------------------------------------------------------

    /// Reacts to an observed link change at `(parent, name)`
    fn on_link(
        &mut self,
        parent_obj: &InodeRow,
        name: &str,
        obj: &mut InodeRow,
        old_obj: Option<&InodeRow>,
    ) -> Result<()> {
        // Replace detection: a new FOB-less regular inode appearing under
        // a name that previously held a FOB-assigned regular inode is a
        // content rewrite (editor save, copy-over). The new inode inherits
        // the FOB and location and gets a fresh working content version.
        if obj.ftype == FobType::Regular && obj.fob.is_none() {
            if let Some(old) = old_obj {
                if old.ftype == FobType::Regular {
                    if let Some(old_fob) = old.fob {
                        if self.flags.mdupdate {
                            debug!(
                                fob = %old_fob,
                                old_ino = old.ino,
                                new_ino = obj.ino,
                                "Detected replacement"
                            );
                        }
                        let fcv = self.store.create_working_fcv(old_fob, old.fcv)?;
                        self.assign_fob(obj, old_fob, old.flv, Some(fcv), true)?;
                    }
                }
            }
        }
        // Creating an FLV needs the parent's FOB. Race windows can link us
        // to a parent before that parent has one; assign_fob revisits the
        // children once it appears.
        if parent_obj.fob.is_some() || parent_obj.iid == ROOT_IID {
            self.on_link_to_fob(parent_obj, name, obj)?;
        }
        Ok(())
    }

    /// Applies the linked-to-FOB policy for an entry under a FOB-bearing
    /// parent
    fn on_link_to_fob(&mut self, parent_obj: &InodeRow, name: &str, obj: &mut InodeRow) -> Result<()> {
        debug_assert!(parent_obj.fob.is_some() || parent_obj.iid == ROOT_IID);
        let parent_fob = parent_obj.fob;
        let txn = self.store.db().ensure_transaction()?;

        if obj.fob.is_none()
            && matches!(obj.ftype, FobType::Directory | FobType::Regular)
        {
            let age = obj
                .btime
                .map(|b| {
                    let now = filoco_store::unix_now() * 1_000_000_000;
                    Duration::from_nanos(now.saturating_sub(b).max(0) as u64)
                })
                .unwrap_or(FOB_CREATE_WAIT);
            if self.from_notify && age < FOB_CREATE_WAIT {
                // Fresh inode seen through a notification: hold off so a
                // rename-over can claim it as a new version instead.
                debug!(ino = obj.ino, name, "Deferring FOB creation for fresh inode");
                self.deferred.push(Deferred {
                    due: Instant::now() + FOB_CREATE_WAIT - age,
                    parent_ino: parent_obj.ino,
                    name: name.to_string(),
                    iid: obj.iid.clone(),
                });
            } else {
                self.create_fob_for(parent_fob, name, obj)?;
            }
        } else if let Some(fob) = obj.fob {
            // Longnamed entries are local qualifications of an existing
            // placement and never produce new location versions.
            if !is_longname(name) {
                let duplicate = match obj.flv {
                    Some(flv_id) => match self.store.get_syncable(&flv_id)? {
                        Some(stored) => match stored.record.body {
                            SyncableBody::Flv(flv) => {
                                flv.parent_fob == parent_fob && flv.name == name
                            }
                            _ => false,
                        },
                        None => false,
                    },
                    None => false,
                };
                if !duplicate {
                    let parents: Vec<Id128> = obj.flv.into_iter().collect();
                    let new_flv = self.store.create_flv(fob, parent_fob, name, parents)?;
                    self.store.set_inode_flv(&obj.iid, &new_flv)?;
                    obj.flv = Some(new_flv);
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Pairs an inode with a FOB/FLV/FCV triple and wakes children that
    /// waited for this FOB
    fn assign_fob(
        &mut self,
        obj: &mut InodeRow,
        fob: Id128,
        flv: Option<Id128>,
        fcv: Option<Id128>,
        replace: bool,
    ) -> Result<()> {
        let txn = self.store.db().ensure_transaction()?;
        if !replace {
            if let Some(current) = self.store.inode_by_iid(&obj.iid)? {
                if current.fob.is_some() {
                    txn.commit()?;
                    return Ok(());
                }
            }
        }
        if self.flags.mdupdate {
            debug!(iid = %obj.iid, fob = %fob, "Assigning inode to FOB");
        }
        self.store
            .assign_inode_versions(&obj.iid, Some(&fob), flv.as_ref(), fcv.as_ref())?;
        obj.fob = Some(fob);
        obj.flv = flv;
        obj.fcv = fcv;

        // A directory gaining its FOB unblocks FLV creation for any
        // children observed earlier.
        if obj.ftype == FobType::Directory {
            for link in self.store.links_of_parent(obj.ino)? {
                let Some(mut child) = self.store.inode_by_ino(link.ino)? else {
                    continue;
                };
                if child.fob.is_some() {
                    continue;
                }
                self.on_link_to_fob(obj, &link.name, &mut child)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Originates a FOB (with initial FLV/FCV) for an unassigned inode
    fn create_fob_for(
        &mut self,
        parent_fob: Option<Id128>,
        name: &str,
        obj: &mut InodeRow,
    ) -> Result<()> {
        let logical = shortname(name);
        match self.store.create_fob(obj.ftype, logical, parent_fob) {
            Ok((fob, flv, fcv)) => self.assign_fob(obj, fob, Some(flv), fcv, true),
            Err(StoreError::Model(e)) => {
                warn!(name, error = %e, "Name not recordable, no FOB created");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Seeds the queue according to the configured init behavior
    pub fn bootstrap(&mut self) -> Result<()> {
        // The root record must exist, otherwise rechecking has nothing to
        // hang onto.
        let root = self.get_root()?;
        match self.opts.init_scan {
            InitScan::All => {
                if self.opts.recursive {
                    if self.opts.start_path.as_os_str().is_empty() {
                        self.push_scan(ScanAction::ScanRecursive, root);
                    } else {
                        let mut info = InodeInfo::open_at(
                            self.store.root_fd(),
                            self.opts.start_path.as_os_str(),
                        )?;
                        if self.find_inode(&mut info, false, false)?.is_none() {
                            return Err(ScanError::NotTracked(
                                self.opts.start_path.display().to_string(),
                            ));
                        }
                        self.push_scan(ScanAction::ScanRecursive, info);
                    }
                } else {
                    self.queue_checks()?;
                }
            }
            InitScan::Pending => {}
        }
        Ok(())
    }

    /// Processes one queued request, recovering per-entry failures
    fn process(&mut self, mut req: ScanRequest) -> Result<()> {
        if self.flags.queue {
            debug!(prio = req.prio, action = ?req.action, "Popped scan request");
        }
        let result = match req.action {
            ScanAction::Check => self.check(&mut req.target),
            ScanAction::Scan => self.scan_target(&mut req.target, false, false),
            ScanAction::ScanRecursive => self.scan_target(&mut req.target, false, true),
        };
        match result {
            Ok(()) => Ok(()),
            Err(ScanError::Stale) | Err(ScanError::CrossMount) => Ok(()),
            Err(ScanError::Io(err)) => {
                warn!(error = %err, "Scan request failed");
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    /// Drains the queue, refilling from unscanned records, yielding to the
    /// event loop periodically
    pub async fn run_queue(&mut self) -> Result<()> {
        loop {
            let mut processed = 0;
            while processed < YIELD_EVERY {
                if self.queue.is_empty() && !self.queue_unscanned()? {
                    return Ok(());
                }
                let Some(req) = self.queue.pop() else {
                    return Ok(());
                };
                self.process(req)?;
                processed += 1;
            }
            // Long walks must not starve the watcher and protocol tasks.
            tokio::task::yield_now().await;
        }
    }

    /// Runs one full pass and returns
    pub async fn run_once(&mut self) -> Result<()> {
        self.bootstrap()?;
        self.run_queue().await?;
        self.refill_attempts.clear();
        Ok(())
    }

    /// Scans the directory containing a notification event
    ///
    /// `rel_dir` is relative to the store root; events on the store root
    /// itself pass an empty path.
    pub fn scan_notified_dir(&mut self, rel_dir: &std::path::Path) -> Result<()> {
        let mut info = if rel_dir.as_os_str().is_empty() {
            self.get_root()?
        } else {
            InodeInfo::open_at(self.store.root_fd(), rel_dir.as_os_str())?
        };
        self.from_notify = true;
        let res = self.scan_target(&mut info, true, false);
        self.from_notify = false;
        res
    }

    /// Retries FOB creations whose notification grace window has elapsed
    pub fn service_deferred(&mut self) -> Result<()> {
        let now = Instant::now();
        let due: Vec<Deferred> = {
            let mut still = Vec::new();
            let mut due = Vec::new();
            for d in self.deferred.drain(..) {
                if d.due <= now {
                    due.push(d);
                } else {
                    still.push(d);
                }
            }
            self.deferred = still;
            due
        };
        for d in due {
            let Some(mut obj) = self.store.inode_by_iid(&d.iid)? else {
                continue;
            };
            if obj.fob.is_some() {
                continue;
            }
            // The link must still be in place for the deferred creation to
            // make sense.
            match self.store.link_get(d.parent_ino, &d.name)? {
                Some(link) if link.ino == obj.ino => {}
                _ => continue,
            }
            let Some(parent) = self.store.inode_by_ino(d.parent_ino)? else {
                continue;
            };
            if parent.fob.is_some() || parent.iid == ROOT_IID {
                self.on_link_to_fob(&parent, &d.name, &mut obj)?;
            }
        }
        Ok(())
    }

    /// Earliest pending deferred deadline, for the watch loop's sleep
    pub fn next_deferred_due(&self) -> Option<Instant> {
        self.deferred.iter().map(|d| d.due).min()
    }
}

/// Reads the entry names of an open directory descriptor
///
/// Goes through `/proc/self/fd` so it works for `O_PATH` descriptors and
/// keeps working when the directory is renamed mid-scan.
fn read_entries(fd: BorrowedFd<'_>) -> Result<Vec<OsString>> {
    let path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        names.push(entry?.file_name());
    }
    Ok(names)
}
