//! One remote program instance and its four byte streams.
//!
//! A [`Session`] owns the stdin, stdout, stderr and portchan pipes plus the
//! cancellation token of the running program. All five share one lifecycle:
//! [`Session::close`] closes every pipe and cancels the program in one step,
//! and nothing reopens afterwards.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pipe::StreamPipe;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Closing,
    Closed,
}

/// The four logical streams of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    /// Client → program.
    Stdin,
    Stdout,
    Stderr,
    /// Listening-port snapshots, server → client.
    Portchan,
}

impl PipeKind {
    pub const ALL: [PipeKind; 4] = [Self::Stdin, Self::Stdout, Self::Stderr, Self::Portchan];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Portchan => "portchan",
        }
    }
}

impl fmt::Display for PipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown stream: {s}"))
    }
}

/// A running (or finished) remote program with its pipes.
pub struct Session {
    pub id: String,
    pub stdin: Arc<StreamPipe>,
    pub stdout: Arc<StreamPipe>,
    pub stderr: Arc<StreamPipe>,
    pub portchan: Arc<StreamPipe>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    /// OS pid once the program is started, 0 before.
    pid: AtomicU32,
    exit_code: Mutex<Option<i32>>,
}

impl Session {
    /// Fresh session: four open, empty pipes and an untriggered cancel token.
    pub fn new(id: String) -> Self {
        Self {
            id,
            stdin: Arc::new(StreamPipe::new()),
            stdout: Arc::new(StreamPipe::new()),
            stderr: Arc::new(StreamPipe::new()),
            portchan: Arc::new(StreamPipe::new()),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Running),
            pid: AtomicU32::new(0),
            exit_code: Mutex::new(None),
        }
    }

    pub fn pipe(&self, kind: PipeKind) -> &Arc<StreamPipe> {
        match kind {
            PipeKind::Stdin => &self.stdin,
            PipeKind::Stdout => &self.stdout,
            PipeKind::Stderr => &self.stderr,
            PipeKind::Portchan => &self.portchan,
        }
    }

    /// Close all four pipes and cancel the program. Idempotent; returns `true`
    /// only for the call that actually closed the session.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Running {
                return false;
            }
            *state = SessionState::Closing;
        }

        self.cancel.cancel();
        for kind in PipeKind::ALL {
            self.pipe(kind).close();
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        debug!("Session {} closed", self.id);
        true
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token cancelled when the session closes; the exit watcher and the probe
    /// each hold a clone.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipeError;
    use std::time::Duration;

    #[test]
    fn pipe_kind_round_trips_through_its_name() {
        for kind in PipeKind::ALL {
            assert_eq!(kind.as_str().parse::<PipeKind>(), Ok(kind));
        }
        assert!("stdwhat".parse::<PipeKind>().is_err());
    }

    #[tokio::test]
    async fn close_shuts_every_pipe_and_cancels() {
        let session = Arc::new(Session::new("s1".into()));
        let token = session.cancel_token();

        let pending: Vec<_> = PipeKind::ALL
            .into_iter()
            .map(|kind| {
                let pipe = Arc::clone(session.pipe(kind));
                tokio::spawn(async move { pipe.read(16).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(token.is_cancelled());

        for read in pending {
            let res = tokio::time::timeout(Duration::from_secs(2), read)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(res, Err(PipeError::Closed));
        }
    }

    #[test]
    fn records_pid_and_exit_code() {
        let session = Session::new("s2".into());
        assert_eq!(session.pid(), None);
        assert_eq!(session.exit_code(), None);
        session.set_pid(4242);
        session.set_exit_code(3);
        assert_eq!(session.pid(), Some(4242));
        assert_eq!(session.exit_code(), Some(3));
    }
}
