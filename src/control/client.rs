//! Client side of the control socket, used by the CLI subcommands.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::net::UnixStream;

pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// # Errors
    /// Returns an error when the daemon is unreachable or answers non-2xx.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await
    }

    /// # Errors
    /// Returns an error when the daemon is unreachable or answers non-2xx.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let payload = serde_json::to_vec(body).context("encoding request body")?;
        self.request(Method::POST, path, Some(payload)).await
    }

    /// # Errors
    /// Returns an error when the daemon is unreachable or answers non-2xx.
    pub async fn delete<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let payload = serde_json::to_vec(body).context("encoding request body")?;
        self.request(Method::DELETE, path, Some(payload)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        let stream = UnixStream::connect(&self.socket).await.with_context(|| {
            format!(
                "connecting to control socket {} (is the daemon running?)",
                self.socket.display()
            )
        })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("control socket handshake")?;

        // The connection task finishes when the response body is done.
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "pordisto")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .context("building control request")?;

        let response = sender
            .send_request(request)
            .await
            .context("sending control request")?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("reading control response")?
            .to_bytes();

        if !status.is_success() {
            let detail = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|value| {
                    value
                        .get("error")
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(anyhow!("{path}: {status}: {detail}"));
        }

        serde_json::from_slice(&bytes).with_context(|| format!("decoding response from {path}"))
    }
}
