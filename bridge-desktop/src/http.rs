//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStream},
};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

const USER_AGENT: &str = concat!("offline-media-core/", env!("CARGO_PKG_VERSION"));

/// Reqwest-based HTTP client
///
/// Buffered requests get a whole-request timeout. Streams only get a connect
/// timeout: a media transfer can legitimately run for an hour, so per-read
/// stalls are policed by the consumer instead.
pub struct ReqwestHttpClient {
    client: Client,
    request_timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// `timeout` applies to buffered [`HttpClient::execute`] calls.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout: timeout,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
        }
    }

    fn build_request(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(Self::convert_method(request.method), &request.url);

        for (key, value) in request.headers {
            req = req.header(key, value);
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }
        req
    }

    fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect()
    }
}

/// Map a reqwest failure onto the bridge taxonomy so callers can decide
/// whether to retry.
fn map_reqwest_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        BridgeError::Connection(err.to_string())
    } else if let Some(status) = err.status() {
        BridgeError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        BridgeError::OperationFailed(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        if request.timeout.is_none() {
            request.timeout = Some(self.request_timeout);
        }
        debug!(url = %request.url, method = ?request.method, "Executing HTTP request");

        let response = self
            .build_request(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = Self::collect_headers(response.headers());
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStream> {
        debug!(
            url = %request.url,
            offset = ?request.requested_offset(),
            "Opening HTTP stream"
        );

        let response = self
            .build_request(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = Self::collect_headers(response.headers());
        let content_length = response.content_length();

        let body = response.bytes_stream().map_err(std::io::Error::other);

        Ok(HttpStream {
            status,
            headers,
            content_length,
            body: Box::new(StreamReader::new(body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(ReqwestHttpClient::new().is_ok());
        assert!(ReqwestHttpClient::with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_method_conversion() {
        assert_eq!(
            ReqwestHttpClient::convert_method(HttpMethod::Get),
            reqwest::Method::GET
        );
        assert_eq!(
            ReqwestHttpClient::convert_method(HttpMethod::Head),
            reqwest::Method::HEAD
        );
    }

    #[test]
    fn test_range_header_is_forwarded() {
        let client = ReqwestHttpClient::new().unwrap();
        let built = client
            .build_request(HttpRequest::get("http://127.0.0.1:1/file").range_from(512))
            .build()
            .unwrap();
        assert_eq!(
            built.headers().get("Range").and_then(|v| v.to_str().ok()),
            Some("bytes=512-")
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let client = ReqwestHttpClient::new().unwrap();
        // Port 1 on loopback is closed on any sane test host.
        let err = client
            .open_stream(HttpRequest::get("http://127.0.0.1:1/file"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
