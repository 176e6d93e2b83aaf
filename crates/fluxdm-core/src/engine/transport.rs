//! HTTP transport seam
//!
//! The prober and segment workers never talk to `reqwest` directly; they go
//! through [`Transport`] so that a download can be driven against any source
//! that speaks the same request/response shape.

use crate::error::{FluxError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use fluxdm_types::EngineConfig;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Body of a response, yielded chunk by chunk
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A requested byte range, rendered as `Range: bytes=<start>-<end>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive; `None` asks for everything from `start`
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes requested, when bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Parse a `Range` request header value (single range only)
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse().ok()?),
        };
        Some(Self { start, end })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// A parsed `Content-Range` response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Inclusive first/last byte; `None` for the unsatisfied form `bytes */N`
    pub range: Option<(u64, u64)>,
    /// Complete length; `None` when the server sent `*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse `bytes a-b/total`, `bytes a-b/*` or `bytes */total`
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;

        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };

        let range = match range.trim() {
            "*" => None,
            r => {
                let (a, b) = r.split_once('-')?;
                let a: u64 = a.trim().parse().ok()?;
                let b: u64 = b.trim().parse().ok()?;
                if b < a {
                    return None;
                }
                Some((a, b))
            }
        };

        Some(Self { range, total })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        match self.range {
            Some((a, b)) => write!(f, "bytes {}-{}/{}", a, b, total),
            None => write!(f, "bytes */{}", total),
        }
    }
}

/// Status line and the headers the engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub content_range: Option<ContentRange>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Accept-Ranges: bytes` was sent
    pub fn advertises_ranges(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false)
    }

    /// `Accept-Ranges: none` was sent
    pub fn refuses_ranges(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .map(|v| v.trim().eq_ignore_ascii_case("none"))
            .unwrap_or(false)
    }

    fn from_reqwest(response: &reqwest::Response) -> Self {
        let headers = response.headers();
        Self {
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
            content_length: header_u64(headers, CONTENT_LENGTH.as_str()),
            accept_ranges: header_str(headers, ACCEPT_RANGES.as_str()),
            content_range: header_str(headers, CONTENT_RANGE.as_str())
                .and_then(|v| ContentRange::parse(&v)),
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

/// A response whose body has not been consumed yet
pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Source of HTTP(S) responses for the prober and workers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Metadata-only request; must not fetch the body
    async fn head(&self, url: &str) -> Result<ResponseHead, TransportError>;

    /// Content request, optionally restricted to `range`
    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport using the engine's user agent and connect timeout
    pub fn new(config: &EngineConfig) -> Result<Self, FluxError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str) -> Result<ResponseHead, TransportError> {
        debug!("HEAD {}", url);
        let response = self.client.head(url).send().await?;
        Ok(ResponseHead::from_reqwest(&response))
    }

    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            debug!("GET {} ({})", url, range);
            request = request.header(RANGE, range.header_value());
        } else {
            debug!("GET {}", url);
        }

        let response = request.send().await?;
        let head = ResponseHead::from_reqwest(&response);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(TransportResponse { head, body })
    }
}
