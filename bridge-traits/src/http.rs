//! HTTP Client Abstraction
//!
//! Buffered requests for small API payloads and streamed, range-aware
//! responses for media transfers.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::error::{BridgeError, Result};

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Request the byte range starting at `offset` through the end of the resource.
    pub fn range_from(self, offset: u64) -> Self {
        self.header("Range", format!("bytes={}-", offset))
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Offset requested through a `Range` header, if any.
    pub fn requested_offset(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("range"))
            .and_then(|(_, v)| v.strip_prefix("bytes="))
            .and_then(|v| v.split('-').next())
            .and_then(|start| start.trim().parse().ok())
    }
}

/// Buffered HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Parse response body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON deserialization failed: {}", e))
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Streamed HTTP response.
///
/// The body is consumed incrementally; nothing is buffered beyond what the
/// reader pulls.
pub struct HttpStream {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Length of the body being delivered (not of the whole resource on a 206).
    pub content_length: Option<u64>,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl HttpStream {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `206 Partial Content`: the server honoured a `Range` header.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First byte position reported by `Content-Range: bytes start-end/total`.
    pub fn content_range_start(&self) -> Option<u64> {
        self.header("content-range")
            .and_then(|v| v.trim().strip_prefix("bytes "))
            .and_then(|v| v.split('-').next())
            .and_then(|start| start.trim().parse().ok())
    }

    /// Whole resource size reported by `Content-Range`, when not `*`.
    pub fn content_range_total(&self) -> Option<u64> {
        self.header("content-range")
            .and_then(|v| v.rsplit('/').next())
            .and_then(|total| total.trim().parse().ok())
    }
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Async HTTP client trait
///
/// Implementations own connection pooling and TLS. They must not retry on
/// their own: transfer retries are decided by the caller, which knows whether
/// a partial file can be resumed.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn resume(client: &dyn HttpClient, url: &str, offset: u64) -> Result<bool> {
///     let stream = client.open_stream(HttpRequest::get(url).range_from(offset)).await?;
///     Ok(stream.is_partial())
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute a request and buffer the whole response body.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Execute a request and hand back the body as a byte stream.
    ///
    /// Non-2xx statuses are returned as a stream, not as an error, so the
    /// caller can inspect `status` and decide how to classify it.
    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStream>;
}
