//! JSON-over-HTTP client for a user-space network's endpoint socket.
//!
//! The forwarding service only listens on a Unix socket, so hyper's HTTP/1
//! connection is driven directly over a tokio `UnixStream`. Every request,
//! from connect to the last body byte, runs under one deadline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;

use crate::DriverError;

#[derive(Debug, Clone)]
pub(crate) struct EndpointClient {
    socket: PathBuf,
    request_timeout: Duration,
}

impl EndpointClient {
    pub(crate) fn new(socket: PathBuf, request_timeout: Duration) -> Self {
        Self {
            socket,
            request_timeout,
        }
    }

    pub(crate) fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// `GET path` and decode the JSON reply.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DriverError> {
        let body = self.call(Method::GET, path, None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| DriverError::Bridge(format!("GET {path}: undecodable reply: {e}")))
    }

    /// `POST path` with a JSON body; the reply body is ignored.
    pub(crate) async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), DriverError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| DriverError::Bridge(format!("POST {path}: encode body: {e}")))?;
        self.call(Method::POST, path, Some(body)).await.map(drop)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes, DriverError> {
        let exchange = round_trip(&self.socket, method.clone(), path, body);
        let (status, reply) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                DriverError::Bridge(format!(
                    "{method} {path} on {}: no reply within {:?}",
                    self.socket.display(),
                    self.request_timeout
                ))
            })??;
        check_status(&method, path, status, &reply)?;
        Ok(reply)
    }
}

async fn round_trip(
    socket: &Path,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(StatusCode, Bytes), DriverError> {
    let bridge = |what: &str, e: &dyn std::fmt::Display| {
        DriverError::Bridge(format!("{method} {path} on {}: {what}: {e}", socket.display()))
    };

    let stream = UnixStream::connect(socket).await.map_err(|e| bridge("connect", &e))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| bridge("handshake", &e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "network endpoint connection ended");
        }
    });

    let mut req = Request::builder().method(method.clone()).uri(path).header(HOST, "localhost");
    let payload = match body {
        Some(json) => {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_LENGTH, json.len());
            Bytes::from(json)
        }
        None => Bytes::new(),
    };
    let req = req.body(Full::new(payload)).map_err(|e| bridge("build request", &e))?;

    let resp = sender.send_request(req).await.map_err(|e| bridge("send", &e))?;
    let status = resp.status();
    let reply = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| bridge("read reply", &e))?
        .to_bytes();
    Ok((status, reply))
}

/// The forwarding service reports failures as a plain-text body.
fn check_status(method: &Method, path: &str, status: StatusCode, reply: &[u8]) -> Result<(), DriverError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(DriverError::Bridge(format!(
            "{method} {path}: endpoint does not serve this API ({status})"
        )));
    }
    let text = String::from_utf8_lossy(reply);
    let reason = match text.trim() {
        "" => status.canonical_reason().unwrap_or("no reason given"),
        msg => msg,
    };
    Err(DriverError::Bridge(format!("{method} {path}: {status}: {reason}")))
}
