//! HTTP client for the devfarm server.
//!
//! [`SpaceClient`] submits source bundles (`POST /api/spaces`) and builds the
//! WebSocket URLs of a session's streams. The server answers a submission
//! with the literal session id on success and the literal error text (build
//! log, limit message) otherwise; the body is never JSON.

use std::time::Duration;

/// HTTP client for one devfarm server.
pub struct SpaceClient {
    http: reqwest::Client,
    base_url: String,
}

impl SpaceClient {
    /// Create a client for the server at `base_url` (`http://` or `https://`).
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url));
        }
        // No overall timeout: a submission lasts as long as the remote build.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ClientError::Request)?;
        Ok(Self { http, base_url })
    }

    /// `POST /api/spaces` — build the bundle remotely and start the program.
    ///
    /// Returns the session id.
    pub async fn submit(&self, bundle: Vec<u8>) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(format!("{}/api/spaces", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(bundle)
            .send()
            .await
            .map_err(ClientError::Request)?;

        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;
        if status.is_success() {
            Ok(body.trim().to_string())
        } else {
            Err(ClientError::Server {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    /// WebSocket URL of one session stream.
    pub fn stream_url(&self, id: &str, stream: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            format!("ws://{}", self.base_url.trim_start_matches("http://"))
        };
        format!("{ws_base}/api/spaces/{id}/{stream}")
    }

    /// Host part of the server URL; where tunnelled connections are dialled.
    pub fn host(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.base_url).ok()?;
        url.host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
    }
}

/// Errors returned by [`SpaceClient`] and the session relay.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// The server refused the submission; `message` is its literal reply.
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    /// Attaching a session stream failed.
    #[error("attaching {stream} failed: {source}")]
    Attach {
        stream: &'static str,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_urls_follow_scheme() {
        let plain = SpaceClient::new("http://farm.local:8080/").unwrap();
        assert_eq!(
            plain.stream_url("abc", "stdout"),
            "ws://farm.local:8080/api/spaces/abc/stdout"
        );
        let tls = SpaceClient::new("https://farm.example.com").unwrap();
        assert_eq!(
            tls.stream_url("abc", "portchan"),
            "wss://farm.example.com/api/spaces/abc/portchan"
        );
    }

    #[test]
    fn host_is_extracted() {
        let client = SpaceClient::new("http://10.1.2.3:8080").unwrap();
        assert_eq!(client.host().as_deref(), Some("10.1.2.3"));
        let v6 = SpaceClient::new("http://[::1]:8080").unwrap();
        assert_eq!(v6.host().as_deref(), Some("::1"));
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            SpaceClient::new("ftp://farm"),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
