//! Stable kernel file handles
//!
//! Wraps `name_to_handle_at(2)` / `open_by_handle_at(2)`, which `nix` does
//! not expose. A [`FileHandle`] survives renames and even unmounts of the
//! file it names; opening one back requires `CAP_DAC_READ_SEARCH` and
//! fails with `ESTALE` once the inode is gone - exactly the property the
//! scanner uses to decide whether a database record still describes a
//! live inode.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::error::{Result, StoreError};

/// Maximum handle payload the kernel may produce (MAX_HANDLE_SZ)
const MAX_HANDLE_SZ: usize = 128;

#[repr(C)]
struct RawHandle {
    handle_bytes: libc::c_uint,
    handle_type: libc::c_int,
    f_handle: [u8; MAX_HANDLE_SZ],
}

/// An opaque, stable reference to a kernel inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Filesystem-specific handle type tag
    pub handle_type: i32,
    /// Filesystem-specific handle payload
    pub bytes: Vec<u8>,
}

/// Obtains the file handle and mount id of an already-open descriptor
///
/// Uses `AT_EMPTY_PATH` so the handle describes the inode behind `fd`
/// itself, independent of any name.
pub fn handle_of_fd(fd: BorrowedFd<'_>) -> Result<(FileHandle, i32)> {
    handle_at(fd, c"", libc::AT_EMPTY_PATH)
}

/// Obtains the file handle and mount id of `name` relative to `dirfd`
pub fn handle_at(
    dirfd: BorrowedFd<'_>,
    name: &std::ffi::CStr,
    flags: libc::c_int,
) -> Result<(FileHandle, i32)> {
    let mut raw = RawHandle {
        handle_bytes: MAX_HANDLE_SZ as libc::c_uint,
        handle_type: 0,
        f_handle: [0u8; MAX_HANDLE_SZ],
    };
    let mut mount_id: libc::c_int = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_name_to_handle_at,
            dirfd.as_raw_fd(),
            name.as_ptr(),
            &mut raw as *mut RawHandle,
            &mut mount_id as *mut libc::c_int,
            flags,
        )
    };
    if rc < 0 {
        return Err(map_errno(std::io::Error::last_os_error()));
    }
    let len = raw.handle_bytes as usize;
    Ok((
        FileHandle {
            handle_type: raw.handle_type,
            bytes: raw.f_handle[..len].to_vec(),
        },
        mount_id,
    ))
}

/// Opens an inode back from its handle, relative to any descriptor on the
/// same mount
pub fn open_by_handle(
    mount_fd: BorrowedFd<'_>,
    handle: &FileHandle,
    flags: libc::c_int,
) -> Result<OwnedFd> {
    if handle.bytes.len() > MAX_HANDLE_SZ {
        return Err(StoreError::Corrupt(format!(
            "file handle too large: {} bytes",
            handle.bytes.len()
        )));
    }
    let mut raw = RawHandle {
        handle_bytes: handle.bytes.len() as libc::c_uint,
        handle_type: handle.handle_type,
        f_handle: [0u8; MAX_HANDLE_SZ],
    };
    raw.f_handle[..handle.bytes.len()].copy_from_slice(&handle.bytes);
    let rc = unsafe {
        libc::syscall(
            libc::SYS_open_by_handle_at,
            mount_fd.as_raw_fd(),
            &mut raw as *mut RawHandle,
            flags,
        )
    };
    if rc < 0 {
        return Err(map_errno(std::io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(rc as i32) })
}

fn map_errno(err: std::io::Error) -> StoreError {
    match err.raw_os_error() {
        Some(libc::ESTALE) | Some(libc::ENOENT) => StoreError::Stale,
        Some(libc::EPERM) => StoreError::HandleNotPermitted,
        _ => StoreError::Io(err),
    }
}
