//! Watch modes
//!
//! Live-update plumbing for the scanner. Three modes:
//!
//! - `none` - one-shot scan, full functionality minus live updates
//! - `inotify` - recursive watch through the `notify` crate
//! - `fanotify` - one mount-wide subscription (Linux only, needs
//!   CAP_SYS_ADMIN); the `.filoco` metadata directory is added to the
//!   ignore mask dynamically as events show up in it
//!
//! Whatever the source, an event is reduced to "rescan the directory that
//! contains the change", flagged `from_notify` so the scanner can apply
//! the FOB-creation grace window.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::scanner::Scanner;

/// Throttle between fanotify read bursts
const FANOTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Fallback wakeup for servicing deferred work
const IDLE_WAKEUP: Duration = Duration::from_secs(5);

/// Selected notification mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// No watcher; scan once and exit
    #[default]
    None,
    /// Recursive inotify watch
    Inotify,
    /// Mount-wide fanotify subscription
    Fanotify,
}

impl FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(WatchMode::None),
            "inotify" => Ok(WatchMode::Inotify),
            "fanotify" => Ok(WatchMode::Fanotify),
            other => Err(format!("unknown watch mode: {other}")),
        }
    }
}

/// Runs the scanner: initial pass, then (per mode) the watch loop
pub async fn run_scanner(scanner: &mut Scanner<'_>, mode: WatchMode) -> Result<()> {
    scanner.bootstrap()?;
    scanner.run_queue().await?;
    match mode {
        WatchMode::None => Ok(()),
        WatchMode::Inotify => run_inotify(scanner).await,
        WatchMode::Fanotify => run_fanotify(scanner).await,
    }
}

/// Maps an absolute event path to the store-relative directory to rescan
///
/// Returns `None` for paths outside the store or inside the metadata
/// directory.
fn dir_to_rescan(root: &Path, meta: &Path, event_path: &Path) -> Option<PathBuf> {
    if event_path.starts_with(meta) {
        return None;
    }
    let rel = event_path.strip_prefix(root).ok()?;
    Some(rel.parent().map(Path::to_path_buf).unwrap_or_default())
}

async fn run_inotify(scanner: &mut Scanner<'_>) -> Result<()> {
    let root = scanner.store().root_path().to_path_buf();
    let meta = scanner.store().meta_path();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(1024);
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                for path in event.paths {
                    // A full channel just means a scan is already due.
                    let _ = tx.blocking_send(path);
                }
            }
            Err(err) => warn!(error = %err, "inotify watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| ScanError::Io(io::Error::other(e)))?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| ScanError::Io(io::Error::other(e)))?;
    debug!(root = %root.display(), "inotify watch established");

    loop {
        let wakeup = scanner
            .next_deferred_due()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAKEUP);
        tokio::select! {
            received = rx.recv() => {
                let Some(first) = received else { break };
                let mut paths = vec![first];
                while let Ok(more) = rx.try_recv() {
                    paths.push(more);
                }
                paths.sort();
                paths.dedup();
                for path in paths {
                    if let Some(rel) = dir_to_rescan(&root, &meta, &path) {
                        if let Err(e) = scanner.scan_notified_dir(&rel) {
                            warn!(path = %path.display(), error = %e, "Notified rescan failed");
                        }
                    }
                }
            }
            _ = tokio::time::sleep(wakeup) => {}
        }
        scanner.service_deferred()?;
        scanner.run_queue().await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// fanotify (libc level; nix has no stable wrapper for the event stream)
// ---------------------------------------------------------------------

/// One decoded fanotify event
struct FanEvent {
    /// Descriptor the kernel opened on the object
    fd: OwnedFd,
    /// Resolved path of that descriptor
    path: PathBuf,
}

/// A mount-wide fanotify subscription
struct Fanotify {
    fd: OwnedFd,
}

impl Fanotify {
    fn new() -> io::Result<Fanotify> {
        let rc = unsafe {
            libc::fanotify_init(
                libc::FAN_CLOEXEC | libc::FAN_CLASS_NOTIF | libc::FAN_NONBLOCK,
                (libc::O_RDONLY | libc::O_LARGEFILE | libc::O_CLOEXEC) as u32,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fanotify {
            fd: unsafe { OwnedFd::from_raw_fd(rc) },
        })
    }

    fn mark_mount(&self, dirfd: BorrowedFd<'_>) -> io::Result<()> {
        self.mark(
            libc::FAN_MARK_ADD | libc::FAN_MARK_MOUNT,
            libc::FAN_CLOSE_WRITE | libc::FAN_ONDIR,
            dirfd.as_raw_fd(),
        )
    }

    /// Suppresses events for the object behind `dirfd` (used for the
    /// metadata directory and everything that appears inside it)
    fn mark_ignored(&self, fd: RawFd) -> io::Result<()> {
        self.mark(
            libc::FAN_MARK_ADD | libc::FAN_MARK_IGNORED_MASK | libc::FAN_MARK_IGNORED_SURV_MODIFY,
            libc::FAN_CLOSE_WRITE | libc::FAN_ONDIR,
            fd,
        )
    }

    fn mark(&self, flags: libc::c_uint, mask: u64, dirfd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::fanotify_mark(
                self.fd.as_raw_fd(),
                flags,
                mask,
                dirfd,
                std::ptr::null::<libc::c_char>(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Drains currently pending events
    fn read_events(&self) -> io::Result<Vec<FanEvent>> {
        let mut buf = [0u8; 4096];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut events = Vec::new();
        let mut off = 0usize;
        let meta_size = std::mem::size_of::<libc::fanotify_event_metadata>();
        while off + meta_size <= n as usize {
            let meta: libc::fanotify_event_metadata = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(off) as *const _)
            };
            if meta.event_len < meta_size as u32 {
                break;
            }
            off += meta.event_len as usize;
            if meta.vers != libc::FANOTIFY_METADATA_VERSION {
                warn!(vers = meta.vers, "Unexpected fanotify metadata version");
                continue;
            }
            if meta.fd < 0 {
                continue;
            }
            let fd = unsafe { OwnedFd::from_raw_fd(meta.fd) };
            let path = match std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())) {
                Ok(p) => p,
                Err(_) => continue,
            };
            events.push(FanEvent { fd, path });
        }
        Ok(events)
    }
}

impl AsRawFd for Fanotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

async fn run_fanotify(scanner: &mut Scanner<'_>) -> Result<()> {
    let root = scanner.store().root_path().to_path_buf();
    let meta = scanner.store().meta_path();
    let fan = Fanotify::new()?;
    fan.mark_mount(scanner.store().root_fd())?;
    // Events caused by our own metadata writes are noise.
    fan.mark_ignored(scanner.store().meta_fd().as_raw_fd())?;
    let afd = AsyncFd::new(fan)?;
    debug!(root = %root.display(), "fanotify mount mark established");

    loop {
        let wakeup = scanner
            .next_deferred_due()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAKEUP);
        tokio::select! {
            guard = afd.readable() => {
                let mut guard = guard?;
                let events = match guard.try_io(|inner| inner.get_ref().read_events()) {
                    Ok(res) => res?,
                    Err(_would_block) => continue,
                };
                for event in events {
                    if event.path.starts_with(&meta) {
                        // New files keep appearing under .filoco; extend
                        // the ignore mask so they stop producing events.
                        if let Err(e) = afd.get_ref().mark_ignored(event.fd.as_raw_fd()) {
                            warn!(error = %e, "Cannot extend fanotify ignore mask");
                        }
                        continue;
                    }
                    if !event.path.starts_with(&root) {
                        // The mark covers the whole mount; events outside
                        // our tree are not ours to handle.
                        continue;
                    }
                    if let Some(rel) = dir_to_rescan(&root, &meta, &event.path) {
                        if let Err(e) = scanner.scan_notified_dir(&rel) {
                            warn!(path = %event.path.display(), error = %e, "Notified rescan failed");
                        }
                    }
                }
                // Batch further events instead of reacting to every close.
                tokio::time::sleep(FANOTIFY_INTERVAL).await;
            }
            _ = tokio::time::sleep(wakeup) => {}
        }
        scanner.service_deferred()?;
        scanner.run_queue().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_mode_parse() {
        assert_eq!(WatchMode::from_str("none").unwrap(), WatchMode::None);
        assert_eq!(WatchMode::from_str("inotify").unwrap(), WatchMode::Inotify);
        assert_eq!(WatchMode::from_str("fanotify").unwrap(), WatchMode::Fanotify);
        assert!(WatchMode::from_str("polling").is_err());
    }

    #[test]
    fn test_dir_to_rescan() {
        let root = Path::new("/store");
        let meta = Path::new("/store/.filoco");
        assert_eq!(
            dir_to_rescan(root, meta, Path::new("/store/a/b.txt")),
            Some(PathBuf::from("a"))
        );
        assert_eq!(
            dir_to_rescan(root, meta, Path::new("/store/top.txt")),
            Some(PathBuf::new())
        );
        assert_eq!(dir_to_rescan(root, meta, Path::new("/store/.filoco/meta.sqlite")), None);
        assert_eq!(dir_to_rescan(root, meta, Path::new("/elsewhere/x")), None);
    }
}
