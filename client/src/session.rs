//! Terminal relay for one remote session.
//!
//! Attaches the session's four WebSocket streams and wires them to the local
//! process:
//!
//! | Stream     | Local side                                  |
//! |------------|---------------------------------------------|
//! | `stdout`   | written to local stdout                     |
//! | `stderr`   | written to local stderr                     |
//! | `portchan` | snapshots fed to the [`PortTunnelManager`]  |
//! | `stdin`    | local stdin, forwarded as binary frames     |
//!
//! The server tears the whole session down as soon as any stream ends, so the
//! relay ends with the first stream too. The remote exit code travels in the
//! stdout close frame as `exit:<code>`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::client::{ClientError, SpaceClient};
use crate::tunnel::{PortSet, PortTunnelManager};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest stdin payload per frame.
const STDIN_CHUNK: usize = 1000;

/// How long to wait for the stdout close frame once another stream ended.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Relay the session until it ends; returns the remote exit code (0 when the
/// server did not report one).
pub async fn run(
    client: &SpaceClient,
    id: &str,
    tunnels: Arc<PortTunnelManager>,
) -> Result<i32, ClientError> {
    let stdout = attach(client, id, "stdout").await?;
    let stderr = attach(client, id, "stderr").await?;
    let portchan = attach(client, id, "portchan").await?;
    let stdin = attach(client, id, "stdin").await?;

    let mut stdout_task = tokio::spawn(forward_output(stdout, tokio::io::stdout()));
    let mut stderr_task = tokio::spawn(forward_output(stderr, tokio::io::stderr()));
    let mut portchan_task = tokio::spawn(feed_tunnels(portchan, Arc::clone(&tunnels)));
    let mut stdin_task = tokio::spawn(forward_stdin(stdin, tokio::io::stdin()));

    let code = tokio::select! {
        res = &mut stdout_task => res.ok().flatten(),
        _ = &mut stderr_task => grace(&mut stdout_task).await,
        _ = &mut portchan_task => grace(&mut stdout_task).await,
        _ = &mut stdin_task => grace(&mut stdout_task).await,
    };

    // The rest of stderr is usually already in flight; give it a moment.
    if !stderr_task.is_finished() {
        let _ = tokio::time::timeout(EXIT_GRACE, &mut stderr_task).await;
    }
    stdout_task.abort();
    stderr_task.abort();
    portchan_task.abort();
    stdin_task.abort();
    tunnels.close();

    debug!("Session {id} ended (exit code {code:?})");
    Ok(code.unwrap_or(0))
}

async fn attach(client: &SpaceClient, id: &str, stream: &'static str) -> Result<Ws, ClientError> {
    let (ws, _) = connect_async(client.stream_url(id, stream))
        .await
        .map_err(|source| ClientError::Attach { stream, source })?;
    Ok(ws)
}

async fn grace(stdout_task: &mut JoinHandle<Option<i32>>) -> Option<i32> {
    match tokio::time::timeout(EXIT_GRACE, stdout_task).await {
        Ok(res) => res.ok().flatten(),
        Err(_) => None,
    }
}

/// Write text/binary frames to `out` until the socket closes; returns the
/// exit code carried by the close frame, if any.
async fn forward_output<W: AsyncWrite + Unpin>(mut ws: Ws, mut out: W) -> Option<i32> {
    while let Some(msg) = ws.next().await {
        let data = match msg {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => return frame.and_then(|f| parse_exit_code(&f.reason)),
            Ok(_) => continue,
            Err(e) => {
                debug!("output stream ended: {e}");
                return None;
            }
        };
        if out.write_all(&data).await.is_err() || out.flush().await.is_err() {
            return None;
        }
    }
    None
}

/// Apply every port snapshot in receipt order.
async fn feed_tunnels(mut ws: Ws, tunnels: Arc<PortTunnelManager>) {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(snapshot)) => {
                let ports = PortSet::parse(&snapshot);
                debug!("port snapshot: [{ports}]");
                tunnels.apply(&ports).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("portchan ended: {e}");
                break;
            }
        }
    }
}

/// Forward `input` in binary frames of at most [`STDIN_CHUNK`] bytes.
///
/// Local EOF only stops forwarding: the socket stays open so the remote
/// program keeps running. Returns once the server side closes.
async fn forward_stdin<R: AsyncRead + Unpin>(ws: Ws, mut input: R) {
    let (mut sink, mut stream) = ws.split();
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut input_open = true;

    loop {
        tokio::select! {
            read = input.read(&mut buf), if input_open => match read {
                Ok(0) => {
                    debug!("local stdin closed");
                    input_open = false;
                }
                Ok(n) => {
                    if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("reading local stdin failed: {e}");
                    input_open = false;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// `exit:<code>` → `code`.
fn parse_exit_code(reason: &str) -> Option<i32> {
    reason.strip_prefix("exit:")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    const BOUND: Duration = Duration::from_secs(5);

    /// One-connection WebSocket server; returns the client side and the
    /// accepted server side.
    async fn ws_pair() -> (Ws, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(conn).await.unwrap()
        });
        let (client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        (client, server.await.unwrap())
    }

    fn close(reason: &'static str) -> Message {
        Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(reason),
        }))
    }

    #[tokio::test]
    async fn output_is_written_and_exit_code_returned() {
        let (client, mut server) = ws_pair().await;
        server.send(Message::Text("hello ".into())).await.unwrap();
        server.send(Message::Binary(b"world".to_vec())).await.unwrap();
        server.send(close("exit:5")).await.unwrap();

        let mut out = Vec::new();
        let code = tokio::time::timeout(BOUND, forward_output(client, &mut out))
            .await
            .unwrap();
        assert_eq!(code, Some(5));
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn close_without_reason_has_no_exit_code() {
        let (client, mut server) = ws_pair().await;
        server.send(Message::Close(None)).await.unwrap();
        let mut out = Vec::new();
        let code = tokio::time::timeout(BOUND, forward_output(client, &mut out))
            .await
            .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn stdin_is_chunked_and_survives_local_eof() {
        let (client, mut server) = ws_pair().await;
        let input = vec![b'x'; STDIN_CHUNK + 10];
        let relay = tokio::spawn(async move { forward_stdin(client, input.as_slice()).await });

        let mut sizes = Vec::new();
        while sizes.iter().sum::<usize>() < STDIN_CHUNK + 10 {
            match tokio::time::timeout(BOUND, server.next()).await.unwrap() {
                Some(Ok(Message::Binary(data))) => sizes.push(data.len()),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(sizes.iter().all(|&n| n <= STDIN_CHUNK), "{sizes:?}");

        // Local EOF leaves the socket open until the server closes it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());
        server.send(Message::Close(None)).await.unwrap();
        tokio::time::timeout(BOUND, relay).await.unwrap().unwrap();
    }

    #[test]
    fn exit_code_from_close_reason() {
        assert_eq!(parse_exit_code("exit:0"), Some(0));
        assert_eq!(parse_exit_code("exit:137"), Some(137));
        assert_eq!(parse_exit_code("exit:-1"), Some(-1));
        assert_eq!(parse_exit_code(""), None);
        assert_eq!(parse_exit_code("exit:"), None);
        assert_eq!(parse_exit_code("bye"), None);
    }
}
