//! Transports
//!
//! The engine only needs a bidirectional byte stream; these helpers
//! provide the supported flavors: stdio (for pipeline/SSH-style use), a
//! TCP connection, a listening TCP port, and a local store-to-store run
//! over a Unix socket pair.

use std::path::Path;

use tokio::net::{TcpListener, TcpStream, UnixStream};
use tracing::{info, warn};

use filoco_core::DebugFlags;
use filoco_store::Store;

use crate::engine::{MdSync, SyncStats};
use crate::error::Result;

/// Runs one reconciliation over stdin/stdout
pub async fn sync_stdio(store: &Store, flags: DebugFlags) -> Result<SyncStats> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    MdSync::new(store, stdin, stdout, flags).run().await
}

/// Connects to `host:port` and runs one reconciliation
pub async fn sync_tcp(store: &Store, addr: &str, flags: DebugFlags) -> Result<SyncStats> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!(addr, "Connected");
    let (read_half, write_half) = stream.into_split();
    MdSync::new(store, read_half, write_half, flags).run().await
}

/// Accepts connections on `port` and reconciles with each peer in turn
///
/// Connections are served sequentially; the store has a single writer
/// anyway, so parallel sessions would only contend on the database lock.
pub async fn sync_listen(store: &Store, port: u16, flags: DebugFlags) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening for peers");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "Peer connected");
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        match MdSync::new(store, read_half, write_half, flags).run().await {
            Ok(stats) => info!(%peer, sent = stats.sent, received = stats.received, "Session done"),
            Err(err) => warn!(%peer, error = %err, "Session failed"),
        }
    }
}

/// Reconciles two local stores over a Unix socket pair
///
/// Both endpoints run on the current task; used by `mdsync STORE DIR`
/// and by tests.
pub async fn sync_local_pair(
    a: &Store,
    b: &Store,
    flags: DebugFlags,
) -> Result<(SyncStats, SyncStats)> {
    let (sa, sb) = UnixStream::pair()?;
    let (ra, wa) = sa.into_split();
    let (rb, wb) = sb.into_split();
    let mut endpoint_a = MdSync::new(a, ra, wa, flags);
    let mut endpoint_b = MdSync::new(b, rb, wb, flags);
    tokio::try_join!(endpoint_a.run(), endpoint_b.run())
}

/// Opens the store at `dir` and reconciles it with `store`
pub async fn sync_local_dir(
    store: &Store,
    dir: &Path,
    flags: DebugFlags,
) -> Result<(SyncStats, SyncStats)> {
    let other = Store::open(dir, flags)?;
    sync_local_pair(store, &other, flags).await
}
