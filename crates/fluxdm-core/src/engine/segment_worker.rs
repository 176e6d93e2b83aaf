//! Segment worker - downloads a single byte range into the shared file
//!
//! Each worker requests its range from `start + bytes_written`, writes every
//! chunk at its absolute offset and reports to the coordinator in order.

use crate::engine::file::DestinationFile;
use crate::engine::rate_limiter::RateGovernor;
use crate::engine::transport::{ByteRange, ResponseHead, Transport};
use crate::error::SegmentError;
use fluxdm_types::{DownloadId, Segment, UNKNOWN_END};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Message from a worker to its coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub index: u32,
    pub event: WorkerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Bytes written at the segment's current end, in order
    Progress(u64),
    /// Total resource size learned from an unknown-length stream
    SizeDiscovered(u64),
    Done,
    Failed(SegmentError),
    /// Stop signal observed; nothing was written after it
    Stopped,
}

/// Everything the workers of one download run share
#[derive(Clone)]
pub struct WorkerContext {
    pub download_id: DownloadId,
    pub url: String,
    pub supports_ranges: bool,
    pub total_size: Option<u64>,
    pub file: DestinationFile,
    pub transport: Arc<dyn Transport>,
    pub governor: RateGovernor,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub reports: mpsc::UnboundedSender<WorkerReport>,
}

enum Outcome {
    Done,
    Stopped,
}

/// A segment worker that downloads a byte range to its place in the file
pub struct SegmentWorker {
    ctx: WorkerContext,
    index: u32,
    start: u64,
    end: u64,
    bytes_written: u64,
}

impl SegmentWorker {
    pub fn new(ctx: WorkerContext, segment: &Segment) -> Self {
        Self {
            ctx,
            index: segment.index,
            start: segment.start,
            end: segment.end,
            bytes_written: segment.bytes_written,
        }
    }

    /// Run the segment download, sending the terminal report last
    pub async fn run(mut self) {
        info!(
            "Starting segment {} for download {} (bytes {}-{}, resume at {})",
            self.index,
            self.ctx.download_id,
            self.start,
            self.end,
            self.offset()
        );

        let event = match self.fetch().await {
            Ok(Outcome::Done) => {
                info!(
                    "Segment {} complete ({} bytes)",
                    self.index, self.bytes_written
                );
                WorkerEvent::Done
            }
            Ok(Outcome::Stopped) => {
                debug!("Segment {} stopped at {}", self.index, self.offset());
                WorkerEvent::Stopped
            }
            Err(e) => WorkerEvent::Failed(e),
        };
        self.report(event);
    }

    fn offset(&self) -> u64 {
        self.start + self.bytes_written
    }

    fn is_unknown_size(&self) -> bool {
        self.end == UNKNOWN_END
    }

    /// Bytes left in the range, `None` while the length is unknown
    fn remaining(&self) -> Option<u64> {
        if self.is_unknown_size() {
            None
        } else {
            Some((self.end + 1).saturating_sub(self.offset()))
        }
    }

    fn report(&self, event: WorkerEvent) {
        let _ = self.ctx.reports.send(WorkerReport {
            index: self.index,
            event,
        });
    }

    /// Range header for the next request
    fn request_range(&self) -> Result<Option<ByteRange>, SegmentError> {
        let offset = self.offset();

        if !self.ctx.supports_ranges {
            // The coordinator restarts non-resumable streams from zero
            if offset != 0 {
                return Err(SegmentError::Internal(format!(
                    "cannot resume at {} without range support",
                    offset
                )));
            }
            return Ok(None);
        }

        Ok(match (self.is_unknown_size(), offset) {
            (true, 0) => None,
            (true, offset) => Some(ByteRange::open(offset)),
            (false, offset) => Some(ByteRange::new(offset, self.end)),
        })
    }

    async fn fetch(&mut self) -> Result<Outcome, SegmentError> {
        if self.remaining() == Some(0) {
            return Ok(Outcome::Done);
        }

        let range = self.request_range()?;
        let cancel = self.ctx.cancel.clone();
        let timeout = self.ctx.timeout;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Stopped),
            response = tokio::time::timeout(timeout, self.ctx.transport.get(&self.ctx.url, range)) => {
                response.map_err(|_| SegmentError::Timeout)??
            }
        };

        self.validate(&response.head, range)?;

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Stopped),
                next = tokio::time::timeout(timeout, body.next()) => next,
            };

            let mut chunk = match next {
                Err(_) => return Err(SegmentError::Timeout),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            // Drop whatever the server sent past our range
            if let Some(remaining) = self.remaining() {
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
            }
            if chunk.is_empty() {
                if self.remaining() == Some(0) {
                    break;
                }
                continue;
            }

            let len = chunk.len() as u64;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Stopped),
                _ = self.ctx.governor.acquire(len) => {}
            }

            self.ctx
                .file
                .write_at(self.offset(), chunk)
                .await
                .map_err(|e| SegmentError::Io(e.to_string()))?;
            self.bytes_written += len;
            self.report(WorkerEvent::Progress(len));

            if self.remaining() == Some(0) {
                break;
            }
        }

        match self.remaining() {
            Some(left) if left > 0 => Err(SegmentError::Incomplete {
                expected: self.end - self.start + 1,
                received: self.bytes_written,
            }),
            _ => Ok(Outcome::Done),
        }
    }

    /// Check the status line and Content-Range against what was asked for
    fn validate(&mut self, head: &ResponseHead, range: Option<ByteRange>) -> Result<(), SegmentError> {
        let offset = self.offset();

        match head.status {
            206 => {
                let Some(requested) = range else {
                    return Err(SegmentError::RangeMismatch {
                        requested: "full body".to_string(),
                        returned: "206 Partial Content".to_string(),
                    });
                };
                let content_range = head.content_range.ok_or_else(|| SegmentError::RangeMismatch {
                    requested: requested.to_string(),
                    returned: "no Content-Range".to_string(),
                })?;

                let matches = match (content_range.range, requested.end) {
                    (Some((first, last)), Some(end)) => first == requested.start && last == end,
                    (Some((first, _)), None) => first == requested.start,
                    (None, _) => false,
                };
                if !matches {
                    return Err(SegmentError::RangeMismatch {
                        requested: requested.to_string(),
                        returned: content_range.to_string(),
                    });
                }

                if self.is_unknown_size() {
                    let total = content_range
                        .total
                        .or_else(|| head.content_length.map(|len| offset + len));
                    self.discover_size(total);
                }
                Ok(())
            }
            200 => {
                let whole_resource = match range {
                    None => true,
                    Some(r) => {
                        r.start == 0
                            && match (r.end, self.ctx.total_size) {
                                (None, _) => true,
                                (Some(end), Some(total)) => end + 1 == total,
                                (Some(_), None) => false,
                            }
                    }
                };
                if offset != 0 || !whole_resource {
                    return Err(SegmentError::RangeMismatch {
                        requested: range
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "full body".to_string()),
                        returned: "200 OK full body".to_string(),
                    });
                }

                if self.is_unknown_size() {
                    self.discover_size(head.content_length);
                }
                Ok(())
            }
            status => Err(SegmentError::Status(status)),
        }
    }

    fn discover_size(&mut self, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            info!("Segment {} discovered total size: {} bytes", self.index, total);
            self.end = total - 1;
            self.report(WorkerEvent::SizeDiscovered(total));
        }
    }
}
