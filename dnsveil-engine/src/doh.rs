//! DoH transport
//!
//! Turns a raw DNS query into an HTTP POST against the configured
//! upstream and streams the response body back into the caller's buffer.
//! The transport is a single-operation seam so tests can substitute an
//! in-memory double for the HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::error::{Error as EngineError, Result as EngineResult};
use crate::wire;

/// Media type for DoH request bodies
const DNS_CONTENT_TYPE: &str = "application/dns-packet";

/// Upstream round-trip timeout
const DOH_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type alias for transport operations
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

/// Errors from a single DoH round trip
#[derive(Debug, Error)]
pub enum ResolveError {
    /// HTTP transport failure
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-200 status; the body is not consumed
    #[error("error code: {0}")]
    Status(u16),

    /// Response body read failure
    #[error("body read error: {0}")]
    Read(#[from] std::io::Error),
}

/// Streamed response body handed back by a transport, owned by the caller
#[async_trait]
pub trait ResponseBody: Send {
    /// Next chunk of the reply, or `None` at end of stream
    async fn chunk(&mut self) -> ResolveResult<Option<Bytes>>;
}

/// DoH transport seam: a DNS query body in, a streamed reply out
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, body: Vec<u8>) -> ResolveResult<Box<dyn ResponseBody>>;
}

/// Production transport: HTTP POST over a shared reqwest client
///
/// The upstream URL and extra-header map are copied in once; changing the
/// configuration requires building a new transport.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpTransport {
    /// Build a transport from the upstream snapshot
    pub fn new(upstream: &UpstreamConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to create HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DNS_CONTENT_TYPE));
        for (name, values) in &upstream.headers {
            let name: HeaderName = name
                .parse()
                .map_err(|_| EngineError::Config(format!("invalid header name: {}", name)))?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(|_| {
                    EngineError::Config(format!("invalid value for header {}", name))
                })?;
                headers.append(name.clone(), value);
            }
        }

        Ok(Self {
            client,
            url: upstream.url.clone(),
            headers,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, body: Vec<u8>) -> ResolveResult<Box<dyn ResponseBody>> {
        let res = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = res.status();
        if status != reqwest::StatusCode::OK {
            return Err(ResolveError::Status(status.as_u16()));
        }

        Ok(Box::new(HttpBody { inner: res }))
    }
}

struct HttpBody {
    inner: reqwest::Response,
}

#[async_trait]
impl ResponseBody for HttpBody {
    async fn chunk(&mut self) -> ResolveResult<Option<Bytes>> {
        Ok(self.inner.chunk().await?)
    }
}

/// Read a streamed DNS reply into `buf`.
///
/// Fills from the start of the buffer until end of stream and returns the
/// length. When the body is larger than the buffer, the reply is cut at
/// the buffer length and the DNS TC bit is set so the client retries over
/// TCP.
pub async fn read_dns_response(
    body: &mut dyn ResponseBody,
    buf: &mut [u8],
) -> ResolveResult<usize> {
    let mut n = 0;
    while let Some(chunk) = body.chunk().await? {
        let room = buf.len() - n;
        if chunk.len() >= room {
            buf[n..].copy_from_slice(&chunk[..room]);
            n = buf.len();
            wire::mark_truncated(buf);
            break;
        }
        buf[n..n + chunk.len()].copy_from_slice(&chunk);
        n += chunk.len();
    }
    Ok(n)
}
