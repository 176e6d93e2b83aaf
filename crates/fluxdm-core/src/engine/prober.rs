//! Range prober - learns a resource's size and Range support before planning
//!
//! Uses HEAD first, then falls back to a `Range: bytes=0-0` request whose
//! body is dropped unread. No content is downloaded here.

use crate::engine::transport::{ByteRange, ResponseHead, Transport};
use crate::error::ProbeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the source told us about the resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    /// The server explicitly sent `Accept-Ranges: bytes`
    pub accept_ranges_confirmed: bool,
    /// URL after redirects
    pub final_url: String,
}

/// Issues the preliminary metadata requests for a download
#[derive(Clone)]
pub struct RangeProber {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    range_probe: bool,
}

impl RangeProber {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, range_probe: bool) -> Self {
        Self {
            transport,
            timeout,
            range_probe,
        }
    }

    /// Probe `url`, bounded by the request timeout
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        info!("Probing URL: {}", url);
        match tokio::time::timeout(self.timeout, self.probe_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    async fn probe_inner(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let head = self.transport.head(url).await?;

        let mut result = ProbeResult {
            total_size: None,
            supports_ranges: false,
            accept_ranges_confirmed: false,
            final_url: url.to_string(),
        };

        // Some servers reject HEAD outright; the range probe has to carry everything
        let head_usable = match head.status {
            405 | 501 => {
                info!("HEAD answered {}, falling back to a range request", head.status);
                false
            }
            _ if !head.is_success() => return Err(ProbeError::Non2xxStatus(head.status)),
            _ => true,
        };

        if head_usable {
            result.final_url = head.final_url.clone();
            result.accept_ranges_confirmed = head.advertises_ranges();
            result.supports_ranges = result.accept_ranges_confirmed;
            // A zero length on HEAD is often an artifact of the empty HEAD body
            result.total_size = if self.range_probe {
                head.content_length.filter(|len| *len > 0)
            } else {
                head.content_length
            };

            let conclusive = result.total_size.is_some()
                && (result.supports_ranges || head.refuses_ranges());
            if conclusive || !self.range_probe {
                debug!(
                    "HEAD conclusive for {}: size={:?}, ranges={}",
                    url, result.total_size, result.supports_ranges
                );
                return Ok(result);
            }
        }

        let probe_url = result.final_url.clone();
        match self
            .transport
            .get(&probe_url, Some(ByteRange::new(0, 0)))
            .await
        {
            Ok(response) => {
                // Headers are all we need
                drop(response.body);
                apply_range_probe(&mut result, &response.head, head_usable)?;
            }
            Err(e) if head_usable => {
                warn!("Range probe failed: {} - continuing with HEAD info", e);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Probe result for {}: size={:?}, ranges={} (confirmed={})",
            url, result.total_size, result.supports_ranges, result.accept_ranges_confirmed
        );
        Ok(result)
    }
}

/// Fold the answer to `Range: bytes=0-0` into `result`
fn apply_range_probe(
    result: &mut ProbeResult,
    head: &ResponseHead,
    head_usable: bool,
) -> Result<(), ProbeError> {
    if !head_usable {
        result.final_url = head.final_url.clone();
        result.accept_ranges_confirmed = head.advertises_ranges();
    }

    match head.status {
        206 => {
            result.supports_ranges = true;
            if let Some(total) = head.content_range.and_then(|cr| cr.total) {
                result.total_size = Some(total);
            }
        }
        200 => {
            // Server ignored the Range header and would send the full body
            result.supports_ranges = false;
            if result.total_size.is_none() {
                result.total_size = head.content_length;
            }
        }
        416 => {
            // `bytes */N`: nothing satisfiable, typically an empty resource
            if let Some(total) = head.content_range.and_then(|cr| cr.total) {
                result.total_size = Some(total);
            }
        }
        status if !head_usable => return Err(ProbeError::Non2xxStatus(status)),
        status => warn!("Range probe answered {} - ignoring", status),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::{ContentRange, TransportResponse};
    use crate::error::TransportError;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        head: ResponseHead,
        range_head: Option<ResponseHead>,
        gets: AtomicUsize,
    }

    fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status,
            final_url: "http://example.com/file".to_string(),
            content_length: None,
            accept_ranges: None,
            content_range: None,
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn head(&self, _url: &str) -> Result<ResponseHead, TransportError> {
            Ok(self.head.clone())
        }

        async fn get(
            &self,
            _url: &str,
            _range: Option<ByteRange>,
        ) -> Result<TransportResponse, TransportError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            match &self.range_head {
                Some(head) => Ok(TransportResponse {
                    head: head.clone(),
                    body: stream::empty().boxed(),
                }),
                None => Err(TransportError::Connect("refused".to_string())),
            }
        }
    }

    fn prober(stub: StubTransport) -> (RangeProber, Arc<StubTransport>) {
        let stub = Arc::new(stub);
        let prober = RangeProber::new(stub.clone(), Duration::from_secs(5), true);
        (prober, stub)
    }

    #[tokio::test]
    async fn test_head_conclusive_skips_range_probe() {
        let mut h = head(200);
        h.content_length = Some(10_000);
        h.accept_ranges = Some("bytes".to_string());
        let (prober, stub) = prober(StubTransport {
            head: h,
            range_head: None,
            gets: AtomicUsize::new(0),
        });

        let result = prober.probe("http://example.com/file").await.unwrap();
        assert_eq!(result.total_size, Some(10_000));
        assert!(result.supports_ranges);
        assert!(result.accept_ranges_confirmed);
        assert_eq!(stub.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_range_probe_discovers_support() {
        let mut h = head(200);
        h.content_length = Some(4096);
        let mut partial = head(206);
        partial.content_range = ContentRange::parse("bytes 0-0/4096");

        let (prober, stub) = prober(StubTransport {
            head: h,
            range_head: Some(partial),
            gets: AtomicUsize::new(0),
        });

        let result = prober.probe("http://example.com/file").await.unwrap();
        assert_eq!(result.total_size, Some(4096));
        assert!(result.supports_ranges);
        assert!(!result.accept_ranges_confirmed);
        assert_eq!(stub.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_length_no_ranges_falls_back() {
        let (prober, _) = prober(StubTransport {
            head: head(200),
            range_head: Some(head(200)),
            gets: AtomicUsize::new(0),
        });

        let result = prober.probe("http://example.com/file").await.unwrap();
        assert_eq!(result.total_size, None);
        assert!(!result.supports_ranges);
    }

    #[tokio::test]
    async fn test_head_not_allowed_uses_range_probe() {
        let mut partial = head(206);
        partial.content_range = ContentRange::parse("bytes 0-0/777");
        let (prober, _) = prober(StubTransport {
            head: head(405),
            range_head: Some(partial),
            gets: AtomicUsize::new(0),
        });

        let result = prober.probe("http://example.com/file").await.unwrap();
        assert_eq!(result.total_size, Some(777));
        assert!(result.supports_ranges);
    }

    #[tokio::test]
    async fn test_non_2xx_is_fatal() {
        let (prober, _) = prober(StubTransport {
            head: head(404),
            range_head: None,
            gets: AtomicUsize::new(0),
        });

        let err = prober.probe("http://example.com/file").await.unwrap_err();
        assert_eq!(err, ProbeError::Non2xxStatus(404));
    }

    #[tokio::test]
    async fn test_unreachable_when_both_requests_fail() {
        let (prober, _) = prober(StubTransport {
            head: head(501),
            range_head: None,
            gets: AtomicUsize::new(0),
        });

        let err = prober.probe("http://example.com/file").await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_empty_resource_from_416() {
        let mut unsatisfiable = head(416);
        unsatisfiable.content_range = ContentRange::parse("bytes */0");
        let (prober, _) = prober(StubTransport {
            head: head(200),
            range_head: Some(unsatisfiable),
            gets: AtomicUsize::new(0),
        });

        let result = prober.probe("http://example.com/file").await.unwrap();
        assert_eq!(result.total_size, Some(0));
    }
}
