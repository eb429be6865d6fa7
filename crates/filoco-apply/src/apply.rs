//! The metadata applier
//!
//! Walks FOBs whose `_new_flvs` stamp is set (meaning: peers sent newer
//! location versions than the local filesystem reflects) and mutates the
//! filesystem to match - creating placeholder inodes for objects whose
//! data was never fetched, and renaming existing inodes to their current
//! logical names.
//!
//! Renames are two-phase to survive cycles: every task first moves to a
//! unique longname (`<name>.FL-<fob>-<n>`), then, where nothing is in the
//! way, back to the plain shortname with `RENAME_NOREPLACE`. A WAL
//! checkpoint runs before any rename so a crash cannot leave renamed
//! inodes that a later scan would mistake for new objects.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;

use nix::fcntl::{openat, renameat2, AtFlags, OFlag, RenameFlags};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::stat::Mode;
use nix::unistd::{fchownat, syncfs, Gid, Uid};
use tracing::{debug, error, info, warn};

use filoco_core::{is_longname, shortname, DebugFlags, Flv, FobType, Id128};
use filoco_scan::{InodeInfo, ScanError};
use filoco_store::{
    DirtyFob, InodeRow, ScanState, Store, StoreError, PLACEHOLDER_TARGET, ROOT_IID,
};

use crate::error::{ApplyError, Result};

/// Upper bound on FOBs per update batch (further bounded by RLIMIT_NOFILE)
const UPDATE_BATCH_SIZE: usize = 1000;

/// Highest longname suffix tried before giving up
const LONGNAME_MAX_SUFFIX: u32 = 1000;

/// Where a task's target directory comes from
enum Parent {
    /// The store root
    Root,
    /// An existing inode paired with the parent FOB
    Inode(InodeRow),
    /// Another task in this batch (the parent had no inode yet)
    Task(usize),
}

/// A shortname rename deferred to phase 2
struct PendingShort {
    parent_ino: u64,
    parent_fd: OwnedFd,
    name: String,
}

/// One FOB's pending location update
struct UpdateTask {
    fob: DirtyFob,
    flv: Flv,
    /// `_new_flvs` stamp captured at collection; cleared only if unchanged
    stamp: i64,
    parent: Parent,
    /// Placeholder name inside `.filoco/placeholder-tmp`, if fresh
    src_name: Option<String>,
    /// The created placeholder inode with a pinned descriptor
    created: Option<(InodeRow, OwnedFd)>,
    rename_to_short: Option<PendingShort>,
    skipped: bool,
}

/// An existing directory entry leading to a FOB's inode
struct GoodLink {
    parent_ino: u64,
    parent_fd: OwnedFd,
    name: String,
    ino: u64,
    was_short: bool,
    short_cand: bool,
}

/// The applier
pub struct MdApply<'a> {
    store: &'a Store,
    flags: DebugFlags,
    batch_size: usize,
    placeholder_fd: OwnedFd,
}

impl<'a> MdApply<'a> {
    /// Creates an applier, sizing batches to the descriptor limit
    pub fn new(store: &'a Store, flags: DebugFlags) -> Result<MdApply<'a>> {
        let placeholder_path = store.placeholder_path();
        fs::create_dir_all(&placeholder_path)?;
        let placeholder_fd = nix::fcntl::open(
            &placeholder_path,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        // Each task can pin a few descriptors; keep 4x headroom.
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
        let batch_size = UPDATE_BATCH_SIZE.min((hard / 4).max(16) as usize);
        let want_soft = ((4 * batch_size) as u64).min(hard);
        if want_soft > soft {
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, want_soft, hard) {
                warn!(error = %e, "Cannot raise RLIMIT_NOFILE, continuing with smaller batches");
            }
        }

        let apply = MdApply {
            store,
            flags,
            batch_size,
            placeholder_fd,
        };
        apply.ensure_root()?;
        Ok(apply)
    }

    /// Applies every pending location update
    pub async fn run(&mut self, force: bool) -> Result<()> {
        let mut start = 0i64;
        loop {
            debug!(start, "Running applier batch");
            match self.perform_one_batch(start, force)? {
                Some(end) => start = end + 1,
                None => break,
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn perform_one_batch(&mut self, start: i64, force: bool) -> Result<Option<i64>> {
        let (mut batch, last_seed) = {
            let txn = self.store.db().ensure_transaction()?;
            self.store.db().lock_now()?;
            let seeds = self.store.dirty_fobs(start, self.batch_size, force)?;
            if seeds.is_empty() {
                txn.commit()?;
                return Ok(None);
            }
            let last_seed = seeds.iter().map(|f| f.rowid).max().unwrap_or(start);
            self.cleanup_placeholders()?;
            let mut batch = self.extend_update_batch(seeds)?;
            self.create_new_inodes(&mut batch)?;
            txn.commit()?;
            (batch, last_seed)
        };

        // Push the WAL into the main database before touching the tree:
        // after a crash between a rename and the database reaching disk, a
        // rescan would take the moved inode for a brand-new FOB.
        self.store.db().wal_checkpoint()?;

        {
            let txn = self.store.db().ensure_transaction()?;
            self.store.db().lock_now()?;
            // Phase 1: unique longnames break any rename cycle.
            self.move_to_longnames(&mut batch)?;
            // Phase 2: back to shortnames where nothing is in the way.
            self.move_to_shortnames(&mut batch)?;
            // All renames must hit disk before the stamps clear, or a
            // power failure would skip the retry.
            syncfs(self.store.root_fd())?;
            self.mark_as_updated(&batch)?;
            txn.commit()?;
        }
        Ok(Some(last_seed))
    }

    /// Makes sure the root inode record exists (a store can receive and
    /// apply metadata before it was ever scanned)
    fn ensure_root(&self) -> Result<()> {
        if self.store.inode_by_iid(ROOT_IID)?.is_some() {
            return Ok(());
        }
        let fd = nix::unistd::dup(self.store.root_fd())?;
        let mut info = InodeInfo::from_fd(fd);
        let st = info.get_stat(self.store, true)?;
        let handle = info.get_handle()?.clone();
        let mtime = st.st_mtime * 1_000_000_000 + st.st_mtime_nsec;
        self.store.insert_inode(&InodeRow {
            iid: ROOT_IID.to_string(),
            ino: st.st_ino,
            handle,
            ftype: FobType::Directory,
            size: Some(st.st_size),
            mtime: Some(mtime),
            ctime: Some(st.st_ctime * 1_000_000_000 + st.st_ctime_nsec),
            btime: Some(mtime),
            scan_state: ScanState::NeverScanned,
            fob: None,
            flv: None,
            fcv: None,
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch collection
    // ------------------------------------------------------------------

    /// The current head FLV of a FOB; several heads are a name conflict,
    /// resolved newest-first
    fn get_cur_flv(&self, fob: &Id128) -> Result<Flv> {
        let heads = self.store.head_flvs(fob)?;
        let Some(first) = heads.first() else {
            return Err(ApplyError::TooMessy(format!("FOB {fob} has no head FLV")));
        };
        if heads.len() > 1 {
            warn!(
                fob = %fob,
                names = ?heads.iter().map(|h| h.flv.name.as_str()).collect::<Vec<_>>(),
                "Name conflict, using the newest head"
            );
        }
        Ok(first.flv.clone())
    }

    /// Reopens a stored inode, discarding the record if the inode is gone
    fn check_inode(&self, row: &InodeRow) -> Result<Option<OwnedFd>> {
        let mut info = InodeInfo::from_db(row);
        match info.ensure_fd(self.store) {
            Ok(fd) => Ok(Some(fd.try_clone_to_owned()?)),
            Err(ScanError::Stale) => {
                self.store.delete_inode(&row.iid)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The single live inode paired with a FOB, if any
    fn fob_single_inode(&self, fob: &Id128) -> Result<Option<(InodeRow, OwnedFd)>> {
        let mut live = Vec::new();
        for row in self.store.inodes_by_fob(fob)? {
            if let Some(fd) = self.check_inode(&row)? {
                live.push((row, fd));
            }
        }
        match live.len() {
            0 => Ok(None),
            1 => Ok(live.pop()),
            n => Err(ApplyError::TooMessy(format!(
                "{n} inodes claim FOB {fob}; remove the extras and run a full rescan"
            ))),
        }
    }

    /// Extends the seed set with FOBs that must move in the same batch:
    /// missing parents, and the current occupants of target names (so
    /// rename chains and cycles resolve together)
    fn extend_update_batch(&self, seeds: Vec<DirtyFob>) -> Result<Vec<UpdateTask>> {
        let mut state = ExtendState {
            adding: HashSet::new(),
            by_fob: HashMap::new(),
            out: Vec::new(),
        };
        for seed in seeds {
            let id = seed.id;
            match self.add_fob(&mut state, seed, false) {
                Ok(_) => {}
                Err(ApplyError::TooMessy(msg)) => {
                    error!(fob = %id, "Cannot update FOB: {msg}");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(state.out)
    }

    fn add_fob(
        &self,
        state: &mut ExtendState,
        fob: DirtyFob,
        ignore_cycle: bool,
    ) -> Result<Option<usize>> {
        if let Some(&idx) = state.by_fob.get(&fob.id) {
            return Ok(Some(idx));
        }
        if state.adding.contains(&fob.id) {
            if ignore_cycle {
                return Ok(None);
            }
            return Err(ApplyError::TooMessy(format!(
                "dependency cycle through FOB {}",
                fob.id
            )));
        }
        state.adding.insert(fob.id);
        let flv = self.get_cur_flv(&fob.id)?;

        let parent = if let Some(parent_fob) = flv.parent_fob {
            match self.fob_single_inode(&parent_fob)? {
                Some((parent_row, parent_fd)) => {
                    self.add_pigeon(state, parent_fd.as_fd(), &flv)?;
                    Parent::Inode(parent_row)
                }
                None => {
                    let parent = self.store.dirty_fob_by_id(&parent_fob)?.ok_or_else(|| {
                        ApplyError::TooMessy(format!(
                            "missing parent FOB {parent_fob} needed for {}",
                            fob.id
                        ))
                    })?;
                    match self.add_fob(state, parent, false)? {
                        Some(idx) => Parent::Task(idx),
                        None => {
                            return Err(ApplyError::TooMessy(format!(
                                "parent of FOB {} unavailable",
                                fob.id
                            )))
                        }
                    }
                }
            }
        } else {
            let root_fd = nix::unistd::dup(self.store.root_fd())?;
            self.add_pigeon(state, root_fd.as_fd(), &flv)?;
            Parent::Root
        };

        let idx = state.out.len();
        state.by_fob.insert(fob.id, idx);
        state.out.push(UpdateTask {
            stamp: fob.new_flvs,
            fob,
            flv,
            parent,
            src_name: None,
            created: None,
            rename_to_short: None,
            skipped: false,
        });
        Ok(Some(idx))
    }

    /// Adds the FOB currently occupying a task's target name ("the pigeon
    /// in the hole") so rename chains resolve in one batch
    fn add_pigeon(
        &self,
        state: &mut ExtendState,
        parent_fd: BorrowedFd<'_>,
        flv: &Flv,
    ) -> Result<()> {
        let pigeon_fd = match openat(
            parent_fd,
            flv.name.as_str(),
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => return Ok(()),
            Err(e) => {
                return Err(ApplyError::TooMessy(format!(
                    "cannot probe target location ({:?}, {}): {e}",
                    flv.parent_fob, flv.name
                )))
            }
        };
        let st = nix::sys::stat::fstat(pigeon_fd.as_fd())
            .map_err(|e| ApplyError::TooMessy(format!("cannot stat pigeon: {e}")))?;
        let Some(pigeon_row) = self.store.inode_by_ino(st.st_ino)? else {
            return Ok(());
        };
        let Some(pigeon_fob) = pigeon_row.fob else {
            return Ok(());
        };
        if pigeon_fob == flv.fob {
            return Ok(());
        }
        if let Some(dirty) = self.store.dirty_fob_by_id(&pigeon_fob)? {
            match self.add_fob(state, dirty, true) {
                Ok(_) => {}
                // Recoverable: the new inode just stays longnamed.
                Err(ApplyError::TooMessy(msg)) => warn!("{msg}"),
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Placeholders
    // ------------------------------------------------------------------

    /// Removes placeholders left by an interrupted earlier run
    fn cleanup_placeholders(&self) -> Result<()> {
        let dir = self.store.placeholder_path();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
            if let Some(row) = self.store.inode_by_ino(meta.ino())? {
                self.store.delete_inode(&row.iid)?;
            }
            debug!(path = %entry.path().display(), "Removed stale placeholder");
        }
        Ok(())
    }

    /// Materializes a placeholder inode for every batch FOB with no inode
    fn create_new_inodes(&self, batch: &mut [UpdateTask]) -> Result<()> {
        for task in batch.iter_mut() {
            if task.skipped {
                continue;
            }
            match self.fob_single_inode(&task.fob.id) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(ApplyError::TooMessy(msg)) => {
                    error!(fob = %task.fob.id, "{msg}");
                    task.skipped = true;
                    continue;
                }
                Err(other) => return Err(other),
            }

            let tmp_name = format!("filoco-mdapply-placeholder-{}", task.fob.id.to_hex());
            let path = self.store.placeholder_path().join(&tmp_name);
            let create_res = match task.fob.ftype {
                FobType::Directory => fs::create_dir(&path),
                FobType::Regular => std::os::unix::fs::symlink(PLACEHOLDER_TARGET, &path),
                other => {
                    error!(fob = %task.fob.id, ftype = ?other, "Cannot materialize placeholder for this type");
                    task.skipped = true;
                    continue;
                }
            };
            match create_res {
                Ok(()) => {}
                // A leftover from an interrupted run; reuse it.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let mut info = InodeInfo::open_at(self.placeholder_fd.as_fd(), OsStr::new(&tmp_name))?;
            let st = info.get_stat(self.store, true)?;
            let handle = info.get_handle()?.clone();
            // A recycled inode number may still have a record; that record
            // is definitionally stale (the placeholder is brand new).
            if let Some(existing) = self.store.inode_by_ino(st.st_ino)? {
                if existing.iid == ROOT_IID {
                    return Err(ApplyError::Store(StoreError::InvariantViolated(
                        "placeholder inode number collides with the root record".into(),
                    )));
                }
                self.store.delete_inode(&existing.iid)?;
            }
            let mtime = st.st_mtime * 1_000_000_000 + st.st_mtime_nsec;
            let row = InodeRow {
                iid: Id128::generate().to_hex(),
                ino: st.st_ino,
                handle,
                ftype: task.fob.ftype,
                size: Some(st.st_size),
                mtime: Some(mtime),
                ctime: Some(st.st_ctime * 1_000_000_000 + st.st_ctime_nsec),
                btime: Some(mtime),
                scan_state: if task.fob.ftype == FobType::Directory {
                    ScanState::NeverScanned
                } else {
                    ScanState::UpToDate
                },
                fob: Some(task.fob.id),
                flv: Some(task.flv.id),
                fcv: None,
            };
            self.store.insert_inode(&row)?;

            // The metadata layer may run privileged; hand the inode to the
            // store owner.
            let (uid, gid) = self.store.owner();
            if let Err(e) = fchownat(
                self.placeholder_fd.as_fd(),
                tmp_name.as_str(),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            ) {
                warn!(name = %tmp_name, error = %e, "Cannot chown placeholder");
            }

            let fd = info
                .fd()
                .ok_or_else(|| ApplyError::TooMessy("placeholder descriptor vanished".into()))?
                .try_clone_to_owned()?;
            if self.flags.mdupdate {
                debug!(fob = %task.fob.id, name = %tmp_name, "Created placeholder");
            }
            task.src_name = Some(tmp_name);
            task.created = Some((row, fd));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Renames
    // ------------------------------------------------------------------

    /// Resolves a task's target directory to `(ino, fd)`
    fn parent_dir(&self, batch: &[UpdateTask], idx: usize) -> Result<Option<(u64, OwnedFd)>> {
        match &batch[idx].parent {
            Parent::Root => {
                let Some(row) = self.store.inode_by_iid(ROOT_IID)? else {
                    return Ok(None);
                };
                Ok(Some((row.ino, nix::unistd::dup(self.store.root_fd())?)))
            }
            Parent::Inode(row) => {
                let mut info = InodeInfo::from_db(row);
                match info.ensure_fd(self.store) {
                    Ok(fd) => Ok(Some((row.ino, fd.try_clone_to_owned()?))),
                    Err(ScanError::Stale) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Parent::Task(parent_idx) => match &batch[*parent_idx].created {
                Some((row, fd)) => Ok(Some((row.ino, fd.try_clone()?))),
                None => Ok(None),
            },
        }
    }

    /// Renames with `RENAME_NOREPLACE` into `logical` or the first free
    /// longname, returning the name that won
    fn rename_to_longname(
        &self,
        src_fd: BorrowedFd<'_>,
        src_name: &str,
        dst_fd: BorrowedFd<'_>,
        logical: &str,
        fob: &Id128,
        try_short: bool,
    ) -> Result<String> {
        let start = if try_short { 0 } else { 1 };
        for idx in start..LONGNAME_MAX_SUFFIX {
            let target = if idx == 0 {
                logical.to_string()
            } else {
                filoco_core::longname(logical, fob, idx)
            };
            match renameat2(
                src_fd,
                src_name,
                dst_fd,
                target.as_str(),
                RenameFlags::RENAME_NOREPLACE,
            ) {
                Ok(()) => return Ok(target),
                Err(nix::errno::Errno::EEXIST) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApplyError::LongnamePoolExhausted(logical.to_string()))
    }

    /// Performs one phase-1 rename and keeps the `links` table in step
    ///
    /// If the links table was out of date we may have renamed a different
    /// inode than recorded; that is fine - the next scan treats the inode
    /// found under the target name as a replacement and preserves its FOB,
    /// the same outcome as rescanning first.
    #[allow(clippy::too_many_arguments)]
    fn rename_and_update_links(
        &self,
        src_fd: BorrowedFd<'_>,
        src_parent_ino: Option<u64>,
        src_name: &str,
        dst_fd: BorrowedFd<'_>,
        dst_ino: u64,
        logical: &str,
        fob: &Id128,
        try_short: bool,
        child_ino: Option<u64>,
    ) -> Result<String> {
        let target = self.rename_to_longname(src_fd, src_name, dst_fd, logical, fob, try_short)?;
        let moved = match src_parent_ino {
            Some(parent) => self.store.link_rename(parent, src_name, dst_ino, &target)?,
            None => false,
        };
        // The originating link may be untracked (fresh placeholders live
        // in the metadata directory); record the new entry directly.
        if !moved {
            if let Some(ino) = child_ino {
                self.store.link_insert(dst_ino, &target, ino)?;
            }
        }
        Ok(target)
    }

    /// Phase 1: move every task into its target directory under a unique
    /// longname (or directly the shortname when nothing conflicts)
    fn move_to_longnames(&self, batch: &mut [UpdateTask]) -> Result<()> {
        for idx in 0..batch.len() {
            if batch[idx].skipped {
                continue;
            }
            let Some((target_ino, target_fd)) = self.parent_dir(batch, idx)? else {
                warn!(fob = %batch[idx].fob.id, "Target directory not found, skipping");
                continue;
            };
            let logical = batch[idx].flv.name.clone();
            let fob_id = batch[idx].fob.id;
            let conflicts = self.store.pigeonhole_conflicts(&batch[idx].flv)?;
            if !conflicts.is_empty() {
                info!(
                    parent = ?batch[idx].flv.parent_fob,
                    name = %logical,
                    "Pigeonhole conflict, keeping all claimants longnamed"
                );
            }

            if let Some(src_name) = batch[idx].src_name.clone() {
                let try_short = conflicts.is_empty();
                let child_ino = batch[idx].created.as_ref().map(|(row, _)| row.ino);
                let target = self.rename_and_update_links(
                    self.placeholder_fd.as_fd(),
                    None,
                    &src_name,
                    target_fd.as_fd(),
                    target_ino,
                    &logical,
                    &fob_id,
                    try_short,
                    child_ino,
                )?;
                if try_short && is_longname(&target) {
                    batch[idx].rename_to_short = Some(PendingShort {
                        parent_ino: target_ino,
                        parent_fd: target_fd.try_clone()?,
                        name: target,
                    });
                }
            } else {
                let good_links = self.good_links(&fob_id)?;
                if good_links.is_empty() {
                    warn!(
                        fob = %fob_id,
                        "No usable links found, not renaming; rescan and apply again"
                    );
                    continue;
                }
                for glink in good_links {
                    let in_place =
                        glink.parent_ino == target_ino && shortname(&glink.name) == logical;
                    if in_place && conflicts.is_empty() && glink.name == logical {
                        continue;
                    }
                    if in_place && !conflicts.is_empty() && is_longname(&glink.name) {
                        // Already qualified on a previous pass.
                        continue;
                    }
                    if in_place && conflicts.is_empty() && is_longname(&glink.name) {
                        // Only the phase-2 shortname move is still pending.
                        if glink.short_cand {
                            batch[idx].rename_to_short = Some(PendingShort {
                                parent_ino: target_ino,
                                parent_fd: target_fd.try_clone()?,
                                name: glink.name,
                            });
                        }
                        continue;
                    }
                    let try_short = conflicts.is_empty() && glink.short_cand;
                    let target = self.rename_and_update_links(
                        glink.parent_fd.as_fd(),
                        Some(glink.parent_ino),
                        &glink.name,
                        target_fd.as_fd(),
                        target_ino,
                        &logical,
                        &fob_id,
                        try_short,
                        Some(glink.ino),
                    )?;
                    if try_short && is_longname(&target) {
                        batch[idx].rename_to_short = Some(PendingShort {
                            parent_ino: target_ino,
                            parent_fd: target_fd.try_clone()?,
                            name: target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 2: atomically drop the longname qualifier where the hole is
    /// free
    fn move_to_shortnames(&self, batch: &mut [UpdateTask]) -> Result<()> {
        for task in batch.iter_mut() {
            let Some(pending) = task.rename_to_short.take() else {
                continue;
            };
            let short = shortname(&pending.name).to_string();
            match renameat2(
                pending.parent_fd.as_fd(),
                pending.name.as_str(),
                pending.parent_fd.as_fd(),
                short.as_str(),
                RenameFlags::RENAME_NOREPLACE,
            ) {
                Ok(()) => {
                    self.store
                        .link_rename(pending.parent_ino, &pending.name, pending.parent_ino, &short)?;
                }
                Err(nix::errno::Errno::EEXIST) => {
                    warn!(
                        name = %pending.name,
                        "Cannot drop longname, something is in the way"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// All still-valid directory entries leading to a FOB's inodes
    ///
    /// Usually one inode and one link; conflicts, interrupted scans and
    /// races can produce more, and the shortname candidate flag picks
    /// which of them may claim the plain name.
    fn good_links(&self, fob: &Id128) -> Result<Vec<GoodLink>> {
        let mut links = Vec::new();
        for inode in self.store.inodes_by_fob(fob)? {
            if self.check_inode(&inode)?.is_none() {
                continue;
            }
            for link in self.store.links_of_ino(inode.ino)? {
                let Some(parent_row) = self.store.inode_by_ino(link.parent)? else {
                    continue;
                };
                let Some(parent_fd) = self.check_inode(&parent_row)? else {
                    continue;
                };
                // The entry must still exist under that name.
                match openat(
                    parent_fd.as_fd(),
                    link.name.as_str(),
                    OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                    Mode::empty(),
                ) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::ENOENT) => continue,
                    Err(e) => return Err(e.into()),
                }
                let was_short = !is_longname(&link.name);
                links.push(GoodLink {
                    parent_ino: link.parent,
                    parent_fd,
                    name: link.name,
                    ino: inode.ino,
                    was_short,
                    short_cand: false,
                });
            }
        }
        let num_shorts = links.iter().filter(|l| l.was_short).count();
        let single = links.len() == 1;
        for link in &mut links {
            link.short_cand = single || (link.was_short && num_shorts == 1);
        }
        Ok(links)
    }

    /// Clears the `_new_flvs` stamps captured at collection time
    ///
    /// Stamp-versioned: a FOB whose stamp moved meanwhile (scanner or
    /// receiver bumped it) stays dirty for the next run.
    fn mark_as_updated(&self, batch: &[UpdateTask]) -> Result<()> {
        for task in batch {
            if task.stamp > 0 {
                self.store.clear_flv_stamp(&task.fob.id, task.stamp)?;
            }
        }
        Ok(())
    }
}

struct ExtendState {
    adding: HashSet<Id128>,
    by_fob: HashMap<Id128, usize>,
    out: Vec<UpdateTask>,
}
