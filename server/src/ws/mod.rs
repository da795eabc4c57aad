//! WebSocket transport for session streams.
//!
//! ## Endpoints
//!
//! `GET /api/spaces/{id}/{stream}` upgrades to a WebSocket bound to one pipe
//! of one session:
//!
//! | Stream     | Direction        | Frames                                   |
//! |------------|------------------|------------------------------------------|
//! | `stdin`    | client → program | binary or text, payload written verbatim |
//! | `stdout`   | program → client | text, ≤ `chunk_size` bytes each          |
//! | `stderr`   | program → client | text, ≤ `chunk_size` bytes each          |
//! | `portchan` | server → client  | text, one whole port snapshot per frame  |
//!
//! An unknown session id or stream name is answered with `404` before the
//! upgrade.
//!
//! ## Connection lifecycle
//!
//! The four sockets of a session live and die together. Whichever endpoint
//! ends first (client disconnect, receive error, or its pipe closing) tears the
//! whole session down through the registry, which closes every other pipe and
//! so ends the other three endpoints. Nothing is retried.
//!
//! When the program exits normally the stdout socket is closed with the
//! reason `exit:<code>`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::error::PipeError;
use crate::sessions::session::{PipeKind, Session};
use crate::AppState;

/// `GET /api/spaces/{id}/{stream}` — attach one session stream.
pub async fn attach(
    State(state): State<AppState>,
    Path((id, stream)): Path<(String, String)>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(kind) = stream.parse::<PipeKind>() else {
        return (StatusCode::NOT_FOUND, format!("unknown stream: {stream}")).into_response();
    };
    let Some(session) = state.registry.get(&id).await else {
        return (StatusCode::NOT_FOUND, format!("unknown session: {id}")).into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let chunk_size = state.config.server.chunk_size.max(4);
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| async move {
        debug!("Session {} {kind} attached", session.id);
        let why = match kind {
            PipeKind::Stdin => inbound(socket, &session).await,
            _ => outbound(socket, &session, kind, chunk_size).await,
        };
        registry
            .teardown(&session, &format!("{kind} endpoint {why}"))
            .await;
    })
}

/// Client frames → stdin pipe. Returns why the endpoint ended.
async fn inbound(mut socket: WebSocket, session: &Session) -> &'static str {
    loop {
        let msg = tokio::select! {
            () = session.closed() => {
                let _ = socket.send(Message::Close(None)).await;
                return "closed with session";
            }
            msg = socket.recv() => msg,
        };

        let data = match msg {
            Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return "disconnected",
            Some(Err(e)) => {
                debug!("Session {} stdin receive error: {e}", session.id);
                return "receive error";
            }
        };
        if data.is_empty() {
            continue;
        }

        // Wait for the program side to take the bytes, but give up as soon as
        // the session goes away.
        tokio::select! {
            () = session.closed() => return "closed with session",
            res = session.stdin.write(&data) => {
                if res.is_err() {
                    return "closed with session";
                }
            }
        }
    }
}

/// Pipe → client text frames. Returns why the endpoint ended.
async fn outbound(socket: WebSocket, session: &Session, kind: PipeKind, chunk_size: usize) -> &'static str {
    let pipe = Arc::clone(session.pipe(kind));
    let (mut sink, mut stream) = socket.split();
    let mut chunker = Utf8Chunker::default();

    loop {
        let max = read_limit(kind, chunk_size, chunker.pending_len());
        tokio::select! {
            read = pipe.read(max) => match read {
                Ok(bytes) => {
                    let text = chunker.push(&bytes);
                    // An empty portchan frame is a real snapshot ("no ports");
                    // elsewhere an empty read just means "try again".
                    if text.is_empty() && kind != PipeKind::Portchan {
                        continue;
                    }
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break "send failed";
                    }
                }
                Err(PipeError::Closed) => {
                    let tail = chunker.finish();
                    if !tail.is_empty() {
                        let _ = sink.send(Message::Text(tail.into())).await;
                    }
                    let reason = match (kind, session.exit_code()) {
                        (PipeKind::Stdout, Some(code)) => format!("exit:{code}"),
                        _ => String::new(),
                    };
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break "closed with session";
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break "disconnected",
                Some(Err(e)) => {
                    debug!("Session {} {kind} receive error: {e}", session.id);
                    break "receive error";
                }
                // Nothing is expected from the client on output streams.
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Most bytes to take from the pipe for the next frame.
///
/// Portchan frames carry one whole snapshot each. The probe is the only
/// writer and each write is taken before the next is buffered, so reading
/// everything yields exactly one snapshot.
fn read_limit(kind: PipeKind, chunk_size: usize, pending: usize) -> usize {
    match kind {
        PipeKind::Portchan => usize::MAX,
        _ => chunk_size.saturating_sub(pending).max(1),
    }
}

/// Turns an arbitrary byte stream into valid UTF-8 frames.
///
/// A multi-byte sequence split across reads is held back and completed by the
/// next read; bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete sequence at the end; wait for more
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back, lossily.
    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_reads_respect_chunk_size_but_snapshots_do_not() {
        assert_eq!(read_limit(PipeKind::Stdout, 1000, 0), 1000);
        assert_eq!(read_limit(PipeKind::Stderr, 1000, 2), 998);
        assert_eq!(read_limit(PipeKind::Stdout, 4, 10), 1);
        assert_eq!(read_limit(PipeKind::Portchan, 1000, 0), usize::MAX);
    }

    #[test]
    fn passes_ascii_through() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(b"hello"), "hello");
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn completes_split_sequences() {
        let snowman = "☃".as_bytes();
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(&[b'a', snowman[0]]), "a");
        assert_eq!(c.pending_len(), 1);
        assert_eq!(c.push(&snowman[1..2]), "");
        assert_eq!(c.push(&[snowman[2], b'b']), "☃b");
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn replaces_invalid_bytes() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(b"a\xffb\xc3\x28"), "a\u{fffd}b\u{fffd}(");
    }

    #[test]
    fn finish_flushes_truncated_tail() {
        let mut c = Utf8Chunker::default();
        assert_eq!(c.push(&"é".as_bytes()[..1]), "");
        assert_eq!(c.finish(), "\u{fffd}");
        assert_eq!(c.finish(), "");
    }
}
