//! Inode references
//!
//! An [`InodeInfo`] abstracts an open inode for the scanner: it knows at
//! any time its open descriptor, its stable file handle, or both. The
//! descriptor is the *strong* mode; under descriptor pressure the queue
//! demotes targets to the *weak* mode by caching the handle and dropping
//! the descriptor. A weak reference reopens by handle on demand and fails
//! with [`ScanError::Stale`] once the inode is gone.
//!
//! Descriptors are `OwnedFd`, so every descriptor is closed exactly once
//! no matter which path drops it.

use std::ffi::OsStr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use nix::fcntl::{openat, OFlag};
use nix::sys::stat::{fstat, FileStat, Mode};

use filoco_core::FobType;
use filoco_store::fhandle::{self, FileHandle};
use filoco_store::{InodeRow, Store, StoreError};

use crate::error::{Result, ScanError};

/// An open-or-openable reference to one kernel inode
#[derive(Debug)]
pub struct InodeInfo {
    fd: Option<OwnedFd>,
    handle: Option<FileHandle>,
    mount_id: Option<i32>,
    stat: Option<FileStat>,
    /// Kernel inode number, once known
    pub ino: Option<u64>,
    /// Filesystem type, once known
    pub ftype: Option<FobType>,
    /// The paired database record id, once known
    pub iid: Option<String>,
}

impl InodeInfo {
    /// Wraps an already-open descriptor
    pub fn from_fd(fd: OwnedFd) -> Self {
        InodeInfo {
            fd: Some(fd),
            handle: None,
            mount_id: None,
            stat: None,
            ino: None,
            ftype: None,
            iid: None,
        }
    }

    /// Builds a weak reference from a database row (handle only)
    pub fn from_db(row: &InodeRow) -> Self {
        InodeInfo {
            fd: None,
            handle: Some(row.handle.clone()),
            mount_id: None,
            stat: None,
            ino: Some(row.ino),
            ftype: Some(row.ftype),
            iid: Some(row.iid.clone()),
        }
    }

    /// Opens `name` under `dirfd` without following symlinks
    ///
    /// `O_PATH` keeps the descriptor usable for stat/handle operations on
    /// any file type while never blocking on FIFOs or devices.
    pub fn open_at(dirfd: BorrowedFd<'_>, name: &OsStr) -> Result<Self> {
        let fd = openat(
            dirfd,
            name.as_bytes(),
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self::from_fd(fd))
    }

    /// The open descriptor, if currently held
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Ensures an open descriptor, reopening by handle if demoted
    pub fn ensure_fd(&mut self, store: &Store) -> Result<BorrowedFd<'_>> {
        if self.fd.is_none() {
            let handle = self.handle.as_ref().ok_or(ScanError::NoReference)?;
            match store.open_handle(handle, OFlag::O_PATH) {
                Ok(fd) => self.fd = Some(fd),
                Err(StoreError::Stale) => return Err(ScanError::Stale),
                Err(StoreError::HandleNotPermitted) => {
                    self.fd = Some(self.reopen_via_links(store)?);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.fd.as_ref().map(|fd| fd.as_fd()).unwrap_or_else(|| unreachable!()))
    }

    /// Reopens a database-known inode by walking its recorded link path
    ///
    /// Fallback for processes without CAP_DAC_READ_SEARCH, where
    /// `open_by_handle_at` is not available. The reopened inode must have
    /// the expected inode number, otherwise the reference is stale.
    fn reopen_via_links(&self, store: &Store) -> Result<OwnedFd> {
        let want_ino = self.ino.ok_or(ScanError::NoReference)?;
        if self.iid.as_deref() == Some(filoco_store::ROOT_IID) {
            let fd = nix::unistd::dup(store.root_fd())?;
            return Ok(fd);
        }
        let mut components: Vec<String> = Vec::new();
        let mut cur = want_ino;
        loop {
            let links = store.links_of_ino(cur)?;
            let Some(link) = links.first() else {
                return Err(ScanError::Stale);
            };
            components.push(link.name.clone());
            let Some(parent_row) = store.inode_by_ino(link.parent)? else {
                return Err(ScanError::Stale);
            };
            if parent_row.iid == filoco_store::ROOT_IID {
                break;
            }
            cur = link.parent;
            if components.len() > 4096 {
                return Err(ScanError::Stale);
            }
        }
        components.reverse();
        let path = components.join("/");
        let fd = openat(
            store.root_fd(),
            path.as_str(),
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|_| ScanError::Stale)?;
        let st = fstat(fd.as_fd()).map_err(|_| ScanError::Stale)?;
        if st.st_ino != want_ino {
            return Err(ScanError::Stale);
        }
        Ok(fd)
    }

    /// The stable handle, computing it from the descriptor if needed
    pub fn get_handle(&mut self) -> Result<&FileHandle> {
        if self.handle.is_none() {
            let fd = self.fd().ok_or(ScanError::NoReference)?;
            let (handle, mount_id) = fhandle::handle_of_fd(fd).map_err(map_store_err)?;
            self.handle = Some(handle);
            self.mount_id = Some(mount_id);
        }
        Ok(self.handle.as_ref().unwrap_or_else(|| unreachable!()))
    }

    /// Mount id of the inode, from the handle computation
    pub fn mount_id(&mut self) -> Result<i32> {
        if self.mount_id.is_none() {
            self.get_handle()?;
        }
        self.mount_id.ok_or(ScanError::NoReference)
    }

    /// The cached stat, refreshing when `force` or not yet read
    pub fn get_stat(&mut self, store: &Store, force: bool) -> Result<FileStat> {
        if force || self.stat.is_none() {
            let fd = self.ensure_fd(store)?;
            let st = fstat(fd)?;
            self.stat = Some(st);
            self.ino = Some(st.st_ino);
            self.ftype = Some(FobType::from_mode(st.st_mode as u32));
        }
        Ok(self.stat.unwrap_or_else(|| unreachable!()))
    }

    /// Kernel inode number, statting if unknown
    pub fn get_ino(&mut self, store: &Store) -> Result<u64> {
        if self.ino.is_none() {
            self.get_stat(store, false)?;
        }
        self.ino.ok_or(ScanError::NoReference)
    }

    /// Filesystem type, statting if unknown
    pub fn get_type(&mut self, store: &Store) -> Result<FobType> {
        if self.ftype.is_none() {
            self.get_stat(store, false)?;
        }
        self.ftype.ok_or(ScanError::NoReference)
    }

    /// Demotes to a weak reference: keep the handle, drop the descriptor
    ///
    /// No-op if the handle cannot be computed (the descriptor is then the
    /// only way back to the inode and must be kept).
    pub fn release_fd(&mut self) {
        if self.fd.is_none() {
            return;
        }
        if self.get_handle().is_ok() {
            self.fd = None;
        }
    }

    /// True while the strong descriptor is held
    pub fn has_fd(&self) -> bool {
        self.fd.is_some()
    }

    /// Duplicates the reference (descriptor included) for queueing
    pub fn duplicate(&self) -> Result<InodeInfo> {
        let fd = match &self.fd {
            Some(fd) => Some(fd.try_clone()?),
            None => None,
        };
        Ok(InodeInfo {
            fd,
            handle: self.handle.clone(),
            mount_id: self.mount_id,
            stat: self.stat,
            ino: self.ino,
            ftype: self.ftype,
            iid: self.iid.clone(),
        })
    }

    /// Forgets the cached stat (forces a re-read next time)
    pub fn clear_stat(&mut self) {
        self.stat = None;
    }
}

fn map_store_err(e: StoreError) -> ScanError {
    match e {
        StoreError::Stale => ScanError::Stale,
        other => ScanError::Store(other),
    }
}

/// The `(mtime, ctime, size, ino)` tuple used to detect racy directory
/// mutations during a scan
pub fn stat_tuple(st: &FileStat) -> (i64, i64, i64, u64) {
    (
        st.st_mtime * 1_000_000_000 + st.st_mtime_nsec,
        st.st_ctime * 1_000_000_000 + st.st_ctime_nsec,
        st.st_size,
        st.st_ino,
    )
}
