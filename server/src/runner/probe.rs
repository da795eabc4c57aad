//! Listening-port discovery for running programs.
//!
//! Every tick the probe asks a [`PortScanner`] which TCP ports the program is
//! listening on and writes the full set to the session's portchan pipe as a
//! comma-separated list (`"8080,9090"`, or `""` for none). Snapshots are always
//! complete, never deltas, so the client can converge from any single one.
//!
//! On Linux the scanner walks `/proc/<pid>/fd` for socket inodes and matches
//! them against the LISTEN rows of `/proc/<pid>/net/tcp` and `tcp6`. Other
//! platforms have no scanner and the probe is simply not started.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::sessions::session::Session;

/// Kernel TCP state code for LISTEN.
const TCP_LISTEN: &str = "0A";

/// Sorted set of TCP ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet(BTreeSet<u16>);

impl PortSet {
    pub fn new() -> Self {
        Self::default()
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

/// Wire form: ascending, comma-separated, no spaces.
impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, port) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

/// Source of "which ports is this process listening on".
pub trait PortScanner: Send + Sync {
    /// Blocking; callers run it on the blocking pool.
    fn listening_ports(&self, pid: u32) -> Result<PortSet, ProbeError>;
}

/// The scanner for the current platform, if it has one.
pub fn platform_scanner() -> Option<Arc<dyn PortScanner>> {
    #[cfg(target_os = "linux")]
    {
        Some(Arc::new(ProcfsScanner::default()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// procfs-backed scanner.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcfsScanner {
    root: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcfsScanner {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

#[cfg(target_os = "linux")]
impl ProcfsScanner {
    /// Scan a procfs mounted (or mocked) at `root`.
    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[cfg(target_os = "linux")]
impl PortScanner for ProcfsScanner {
    fn listening_ports(&self, pid: u32) -> Result<PortSet, ProbeError> {
        let proc_dir = self.root.join(pid.to_string());

        let mut inodes = HashSet::new();
        for entry in std::fs::read_dir(proc_dir.join("fd"))? {
            // fds come and go while we walk; a vanished one is not an error
            let Ok(entry) = entry else { continue };
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            if let Some(inode) = parse_socket_inode(&target.to_string_lossy()) {
                inodes.insert(inode);
            }
        }
        if inodes.is_empty() {
            return Ok(PortSet::new());
        }

        let mut ports = PortSet::new();
        for table in ["tcp", "tcp6"] {
            match std::fs::read_to_string(proc_dir.join("net").join(table)) {
                Ok(content) => ports.0.extend(parse_tcp_table(&content, &inodes).iter()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ports)
    }
}

/// `socket:[12345]` → `12345`.
fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Ports of LISTEN rows in a `/proc/net/tcp{,6}` table whose inode is in
/// `inodes`.
fn parse_tcp_table(content: &str, inodes: &HashSet<u64>) -> PortSet {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            if !inodes.contains(&inode) {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

/// Start publishing port snapshots for `pid` on the session's portchan.
///
/// Stops when the session closes or the pipe refuses a write.
pub fn spawn_probe(
    session: Arc<Session>,
    pid: u32,
    scanner: Arc<dyn PortScanner>,
    interval: Duration,
) -> JoinHandle<()> {
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            let scan = Arc::clone(&scanner);
            let ports = match tokio::task::spawn_blocking(move || scan.listening_ports(pid)).await {
                Ok(Ok(ports)) => ports,
                Ok(Err(e)) => {
                    debug!("Port scan of pid {pid} skipped: {e}");
                    continue;
                }
                Err(e) => {
                    warn!("Port scan task for pid {pid} failed: {e}");
                    continue;
                }
            };

            let snapshot = ports.to_string();
            debug!("Session {} ports: [{snapshot}]", session.id);
            tokio::select! {
                () = cancel.cancelled() => break,
                res = session.portchan.write(snapshot.as_bytes()) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Port probe for session {} stopped", session.id);
    })
}
