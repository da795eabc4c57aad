//! Launching a built program inside a session.
//!
//! [`start_process`] unpacks the artifact into a scratch directory, spawns the
//! program in its own process group with piped stdio, and wires the session:
//!
//! ```text
//! session.stdin  --pump--> child stdin
//! child stdout   --pump--> session.stdout
//! child stderr   --pump--> session.stderr
//! probe          -------> session.portchan
//! ```
//!
//! A watcher task owns the [`Child`]. When the program exits on its own the
//! watcher records the exit code, waits until what is left of the output has
//! been read, then tears the session down. When the session is cancelled first the
//! watcher SIGKILLs the whole process group. Either way the scratch directory
//! is removed afterwards.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::{spawn_probe, PortScanner};
use crate::bundle::{self, RESOURCES_DIR};
use crate::error::StartError;
use crate::sessions::pipe::StreamPipe;
use crate::sessions::session::{Session, SessionState};
use crate::sessions::SessionRegistry;
use crate::stream::{pump, ByteSink, IoStream};

/// How long the exit watcher waits for stdout/stderr to be read out.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-run knobs taken from the server config.
#[derive(Clone)]
pub struct RunOptions {
    /// Bridge read size; matches the transport chunk size.
    pub chunk_size: usize,
    pub probe_interval: Duration,
    /// `None` disables port discovery.
    pub scanner: Option<Arc<dyn PortScanner>>,
}

/// Start the program contained in `artifact` and attach it to `session`.
///
/// Returns the OS pid. On error nothing is left running; the caller releases
/// the session.
pub async fn start_process(
    registry: SessionRegistry,
    session: Arc<Session>,
    artifact: Vec<u8>,
    opts: RunOptions,
) -> Result<u32, StartError> {
    if session.state() != SessionState::Running {
        return Err(StartError::SessionClosed);
    }

    let workdir = tempfile::Builder::new().prefix("devfarm-run-").tempdir()?;
    let root = workdir.path().to_path_buf();
    let program = tokio::task::spawn_blocking(move || prepare_run_dir(&artifact, &root))
        .await
        .map_err(|e| StartError::Io(std::io::Error::other(e)))??;

    let cwd = workdir.path().join(RESOURCES_DIR);
    let mut child = spawn_program(&program, &cwd).map_err(StartError::Spawn)?;
    let pid = child.id().unwrap_or(0);
    session.set_pid(pid);
    info!(
        "Session {} started {} (pid {pid})",
        session.id,
        program.display()
    );

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(StartError::Spawn(std::io::Error::other("child stdio not piped")));
    };

    let chunk_size = opts.chunk_size.max(1);

    let mut stdin_src = Arc::clone(&session.stdin);
    tokio::spawn(async move {
        let mut dst = IoStream(stdin);
        if let Err(e) = pump(&mut stdin_src, &mut dst, chunk_size).await {
            debug!("stdin bridge ended: {e}");
        }
        dst.close().await;
    });

    let bridges = vec![
        output_bridge(IoStream(stdout), Arc::clone(&session.stdout), chunk_size),
        output_bridge(IoStream(stderr), Arc::clone(&session.stderr), chunk_size),
    ];

    if let Some(scanner) = opts.scanner.filter(|_| pid != 0) {
        spawn_probe(Arc::clone(&session), pid, scanner, opts.probe_interval);
    }

    tokio::spawn(watch_exit(registry, session, child, bridges, workdir));
    Ok(pid)
}

/// Spawn `program` with piped stdio in its own process group.
pub fn spawn_program(program: &Path, cwd: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

/// Unpack the artifact, pick the program and make sure it can run.
fn prepare_run_dir(artifact: &[u8], root: &Path) -> Result<PathBuf, StartError> {
    let files = bundle::extract(artifact, root)?;
    std::fs::create_dir_all(root.join(RESOURCES_DIR))?;

    let program = files
        .iter()
        .find(|p| {
            p.components().count() == 1
                && p.extension().map_or(true, |ext| ext != "so")
                && p.as_os_str() != RESOURCES_DIR
        })
        .ok_or(StartError::NoProgram)?;
    let program = root.join(program);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(program)
}

fn output_bridge<R>(mut src: IoStream<R>, mut dst: Arc<StreamPipe>, chunk_size: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match pump(&mut src, &mut dst, chunk_size).await {
            Ok(n) => debug!("output bridge finished after {n} bytes"),
            Err(e) => debug!("output bridge ended: {e}"),
        }
    })
}

async fn watch_exit(
    registry: SessionRegistry,
    session: Arc<Session>,
    mut child: Child,
    bridges: Vec<JoinHandle<()>>,
    workdir: TempDir,
) {
    let pid = session.pid();
    let cancel = session.cancel_token();

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        () = cancel.cancelled() => None,
    };

    match status {
        Some(status) => {
            let code = exit_code(status);
            session.set_exit_code(code);
            info!("Session {} program exited with code {code}", session.id);
            let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
                futures::future::join_all(bridges).await;
                tokio::join!(session.stdout.drained(), session.stderr.drained());
            })
            .await;
            if drained.is_err() {
                warn!("Session {} output not drained before teardown", session.id);
            }
            kill_group(pid);
            registry.teardown(&session, "program exited").await;
        }
        None => {
            kill_group(pid);
            if let Err(e) = child.kill().await {
                debug!("kill after cancel: {e}");
            }
            info!("Session {} program killed", session.id);
        }
    }

    if let Err(e) = workdir.close() {
        warn!("Failed to remove run directory: {e}");
    }
}

/// Exit code, or 128 + signal number for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

/// SIGKILL every process left in the program's group.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // ESRCH just means the group is already gone
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}
