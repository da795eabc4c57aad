//! Port tunnel manager.
//!
//! The server publishes the set of TCP ports the remote program listens on as
//! comma-separated snapshots (`"80,4321"`). [`PortTunnelManager::apply`]
//! converges the local listener table to the latest snapshot: every
//! advertised port gets a local listener, and every connection accepted there
//! is relayed to the same port on the server host.
//!
//! ```text
//! local app ──► bind_host:port ──relay──► upstream_host:port ──► remote program
//! ```
//!
//! Removing a port closes its listener only; relays already running end on
//! their own. Each relay pair is two copy tasks sharing one cancellation
//! token, so either direction finishing closes both sockets of that pair and
//! nothing else.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. fd exhaustion) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors raised while opening a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("binding {host}:{port} failed: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// A set of TCP ports, ordered ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet(BTreeSet<u16>);

impl PortSet {
    /// Parse a comma-separated snapshot. Empty and non-numeric tokens are
    /// dropped, so `""` is the empty set.
    pub fn parse(snapshot: &str) -> Self {
        snapshot
            .split(',')
            .filter_map(|token| token.trim().parse::<u16>().ok())
            .collect()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u16> for PortSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for port in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{port}")?;
            first = false;
        }
        Ok(())
    }
}

/// One live listener. Cancelling the token stops its accept loop.
struct Tunnel {
    cancel: CancellationToken,
}

#[derive(Default)]
struct ListenerTable {
    tunnels: HashMap<u16, Tunnel>,
    /// Last snapshot applied; an identical one is ignored.
    last: Option<PortSet>,
}

/// Mirrors remote listening ports as local listeners.
pub struct PortTunnelManager {
    bind_host: String,
    upstream_host: String,
    table: Mutex<ListenerTable>,
}

impl PortTunnelManager {
    pub fn new(bind_host: impl Into<String>, upstream_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            upstream_host: upstream_host.into(),
            table: Mutex::new(ListenerTable::default()),
        }
    }

    /// Converge the listener table to `snapshot`.
    ///
    /// Ports that fail to bind are skipped; they are tried again on the next
    /// snapshot that differs from this one.
    pub async fn apply(&self, snapshot: &PortSet) {
        let (added, removed) = {
            let mut table = self.lock();
            if table.last.as_ref() == Some(snapshot) {
                return;
            }
            table.last = Some(snapshot.clone());

            let gone: Vec<u16> = table
                .tunnels
                .keys()
                .copied()
                .filter(|port| !snapshot.contains(*port))
                .collect();
            let removed: Vec<(u16, Tunnel)> = gone
                .into_iter()
                .filter_map(|port| table.tunnels.remove(&port).map(|t| (port, t)))
                .collect();
            let added: Vec<u16> = snapshot
                .iter()
                .filter(|port| !table.tunnels.contains_key(port))
                .collect();
            (added, removed)
        };

        for (port, tunnel) in removed {
            tunnel.cancel.cancel();
            info!("Tunnel on port {port} closed");
        }

        for port in added {
            let listener = match self.bind(port).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("{e}; skipping port {port}");
                    continue;
                }
            };
            let cancel = CancellationToken::new();
            {
                let mut table = self.lock();
                if table.tunnels.contains_key(&port) {
                    continue;
                }
                table.tunnels.insert(
                    port,
                    Tunnel {
                        cancel: cancel.clone(),
                    },
                );
            }
            info!("Tunnel on port {port} -> {}:{port}", self.upstream_host);
            tokio::spawn(accept_loop(listener, self.upstream_host.clone(), port, cancel));
        }
    }

    /// Ports with a live listener.
    pub fn live_ports(&self) -> PortSet {
        self.lock().tunnels.keys().copied().collect()
    }

    /// Close every listener. Relays in flight are left to finish.
    pub fn close(&self) {
        let tunnels: Vec<Tunnel> = {
            let mut table = self.lock();
            table.last = None;
            table.tunnels.drain().map(|(_, t)| t).collect()
        };
        for tunnel in tunnels {
            tunnel.cancel.cancel();
        }
    }

    async fn bind(&self, port: u16) -> Result<TcpListener, TunnelError> {
        TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|source| TunnelError::Bind {
                host: self.bind_host.clone(),
                port,
                source,
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ListenerTable> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for PortTunnelManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(listener: TcpListener, upstream_host: String, port: u16, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((local, peer)) => {
                debug!("Tunnel {port}: connection from {peer}");
                tokio::spawn(relay(local, upstream_host.clone(), port));
            }
            Err(e) => {
                warn!("Tunnel {port}: accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Tunnel {port}: listener closed");
}

/// Pair `local` with a fresh connection to `upstream_host:port`.
async fn relay(local: TcpStream, upstream_host: String, port: u16) {
    let upstream = match TcpStream::connect((upstream_host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Tunnel {port}: dialing {upstream_host}:{port} failed: {e}");
            return;
        }
    };

    let (local_rx, local_tx) = local.into_split();
    let (upstream_rx, upstream_tx) = upstream.into_split();
    let pair = CancellationToken::new();

    let outbound = tokio::spawn(copy_until_cancelled(local_rx, upstream_tx, pair.clone()));
    let inbound = tokio::spawn(copy_until_cancelled(upstream_rx, local_tx, pair));
    let (sent, received) = (outbound.await, inbound.await);
    debug!(
        "Tunnel {port}: pair closed ({} bytes out, {} bytes in)",
        sent.unwrap_or(0),
        received.unwrap_or(0)
    );
}

/// Copy until EOF, error, or the other direction finishing. Either way the
/// pair is cancelled so the other direction stops too, and both halves drop.
async fn copy_until_cancelled<R, W>(mut src: R, mut dst: W, pair: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        () = pair.cancelled() => 0,
        res = tokio::io::copy(&mut src, &mut dst) => res.unwrap_or(0),
    };
    pair.cancel();
    let _ = dst.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    const BOUND: Duration = Duration::from_secs(5);

    /// A port nothing is listening on right now.
    async fn free_port(host: &str) -> u16 {
        let listener = TcpListener::bind((host, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn refused(host: &str, port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + BOUND;
        loop {
            if TcpStream::connect((host, port)).await.is_err() {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Echo server; reports on `closed` each time a connection sees EOF.
    async fn echo_server(host: &str) -> (u16, mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind((host, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = tx.send(());
                });
            }
        });
        (port, rx)
    }

    async fn roundtrip(conn: &mut TcpStream, payload: &[u8]) {
        conn.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        tokio::time::timeout(BOUND, conn.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn parse_drops_junk_tokens() {
        let set = PortSet::parse("8080,,abc,80, 443,70000");
        assert_eq!(set.to_string(), "80,443,8080");
        assert_eq!(PortSet::parse(""), PortSet::default());
        assert_eq!(PortSet::parse(",,"), PortSet::default());
    }

    #[tokio::test]
    async fn applying_the_same_snapshot_twice_is_a_noop() {
        let a = free_port("127.0.0.1").await;
        let b = free_port("127.0.0.1").await;
        let manager = PortTunnelManager::new("127.0.0.1", "127.0.0.1");
        let snapshot: PortSet = [a, b].into_iter().collect();

        manager.apply(&snapshot).await;
        assert_eq!(manager.live_ports(), snapshot);
        manager.apply(&snapshot).await;
        assert_eq!(manager.live_ports(), snapshot);
        assert!(TcpStream::connect(("127.0.0.1", a)).await.is_ok());
    }

    #[tokio::test]
    async fn removed_port_closes_and_kept_port_stays() {
        let a = free_port("127.0.0.1").await;
        let b = free_port("127.0.0.1").await;
        let manager = PortTunnelManager::new("127.0.0.1", "127.0.0.1");

        manager.apply(&[a, b].into_iter().collect()).await;
        manager.apply(&[b].into_iter().collect()).await;

        assert_eq!(manager.live_ports(), [b].into_iter().collect());
        assert!(refused("127.0.0.1", a).await, "port {a} still open");
        assert!(TcpStream::connect(("127.0.0.1", b)).await.is_ok());
    }

    #[tokio::test]
    async fn busy_port_is_retried_on_a_differing_snapshot() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy = blocker.local_addr().unwrap().port();
        let other = free_port("127.0.0.1").await;
        let manager = PortTunnelManager::new("127.0.0.1", "127.0.0.1");

        let first: PortSet = [busy].into_iter().collect();
        manager.apply(&first).await;
        assert_eq!(manager.live_ports(), PortSet::default());

        drop(blocker);
        manager.apply(&first).await;
        assert_eq!(manager.live_ports(), PortSet::default(), "identical snapshot must not retry");

        manager.apply(&[busy, other].into_iter().collect()).await;
        assert_eq!(manager.live_ports(), [busy, other].into_iter().collect());
    }

    #[tokio::test]
    async fn close_drops_every_listener() {
        let a = free_port("127.0.0.1").await;
        let manager = PortTunnelManager::new("127.0.0.1", "127.0.0.1");
        manager.apply(&[a].into_iter().collect()).await;
        manager.close();
        assert_eq!(manager.live_ports(), PortSet::default());
        assert!(refused("127.0.0.1", a).await);
    }

    // 127.0.0.2 is only routed to loopback out of the box on Linux.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn relays_to_the_same_port_upstream() {
        let (port, mut upstream_closed) = echo_server("127.0.0.1").await;
        let manager = PortTunnelManager::new("127.0.0.2", "127.0.0.1");
        manager.apply(&[port].into_iter().collect()).await;
        assert_eq!(manager.live_ports(), [port].into_iter().collect());

        let mut first = TcpStream::connect(("127.0.0.2", port)).await.unwrap();
        let mut second = TcpStream::connect(("127.0.0.2", port)).await.unwrap();
        roundtrip(&mut first, b"ping").await;
        roundtrip(&mut second, b"pong").await;

        // Closing one side of a pair closes the upstream side too...
        drop(first);
        tokio::time::timeout(BOUND, upstream_closed.recv())
            .await
            .unwrap()
            .unwrap();
        // ...without touching the other pair or the listener.
        roundtrip(&mut second, b"still here").await;
        let mut third = TcpStream::connect(("127.0.0.2", port)).await.unwrap();
        roundtrip(&mut third, b"new").await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn upstream_close_reaches_local_peer() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                drop(conn);
            }
        });
        let manager = PortTunnelManager::new("127.0.0.2", "127.0.0.1");
        manager.apply(&[port].into_iter().collect()).await;

        let mut conn = TcpStream::connect(("127.0.0.2", port)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(BOUND, conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
