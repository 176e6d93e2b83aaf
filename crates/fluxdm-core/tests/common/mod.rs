//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use fluxdm_core::fluxdm_types::{DownloadId, EngineConfig, EngineEvent, ProgressSnapshot};
use fluxdm_core::{
    ByteRange, ContentRange, EventSubscriber, ResponseHead, Transport, TransportError,
    TransportResponse,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;

/// A request seen by [`MockSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Head,
    Get(Option<ByteRange>),
}

#[derive(Debug, Clone)]
enum Fault {
    /// Break any stream that passes through `at` after delivering the bytes before it
    Reset { at: u64, times: u32 },
    /// Stop producing body bytes at `at` without closing the stream
    Stall { at: u64, times: u32 },
    /// Answer requests starting at `start` with `status`
    Status { start: u64, status: u16, times: u32 },
}

/// In-memory HTTP source that records requests and injects faults
pub struct MockSource {
    body: Vec<u8>,
    ranges: bool,
    advertise_length: bool,
    chunk: usize,
    chunk_delay: Option<Duration>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<Call>>,
}

impl MockSource {
    /// A well-behaved source: Content-Length and byte ranges
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges: true,
            advertise_length: true,
            chunk: 64 * 1024,
            chunk_delay: None,
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// No Accept-Ranges, no Content-Length, Range headers ignored
    pub fn plain_stream(body: Vec<u8>) -> Self {
        Self {
            ranges: false,
            advertise_length: false,
            ..Self::new(body)
        }
    }

    pub fn chunked(mut self, chunk: usize, delay: Option<Duration>) -> Self {
        self.chunk = chunk.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn reset_at(self, at: u64, times: u32) -> Self {
        self.faults.lock().push(Fault::Reset { at, times });
        self
    }

    pub fn stall_at(self, at: u64, times: u32) -> Self {
        self.faults.lock().push(Fault::Stall { at, times });
        self
    }

    pub fn status_at(self, start: u64, status: u16, times: u32) -> Self {
        self.faults.lock().push(Fault::Status { start, status, times });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Ranged GETs, excluding the one-byte probe request
    pub fn segment_requests(&self) -> Vec<ByteRange> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Get(Some(range)) if *range != ByteRange::new(0, 0) => Some(*range),
                _ => None,
            })
            .collect()
    }

    fn len(&self) -> u64 {
        self.body.len() as u64
    }

    fn take_status_fault(&self, start: u64) -> Option<u16> {
        let mut faults = self.faults.lock();
        for fault in faults.iter_mut() {
            if let Fault::Status { start: s, status, times } = fault {
                if *s == start && *times > 0 {
                    *times -= 1;
                    return Some(*status);
                }
            }
        }
        None
    }

    /// First Reset or Stall fault inside `start..=end`, with whether it stalls
    fn take_cut_fault(&self, start: u64, end: u64) -> Option<(u64, bool)> {
        let mut faults = self.faults.lock();
        for fault in faults.iter_mut() {
            let (at, times, stall) = match fault {
                Fault::Reset { at, times } => (*at, times, false),
                Fault::Stall { at, times } => (*at, times, true),
                Fault::Status { .. } => continue,
            };
            if at > start && at <= end && *times > 0 {
                *times -= 1;
                return Some((at, stall));
            }
        }
        None
    }

    fn head_for(&self, url: &str, status: u16, length: Option<u64>) -> ResponseHead {
        ResponseHead {
            status,
            final_url: url.to_string(),
            content_length: length.filter(|_| self.advertise_length),
            accept_ranges: self.ranges.then(|| "bytes".to_string()),
            content_range: None,
        }
    }
}

#[async_trait]
impl Transport for MockSource {
    async fn head(&self, url: &str) -> Result<ResponseHead, TransportError> {
        self.calls.lock().push(Call::Head);
        Ok(self.head_for(url, 200, Some(self.len())))
    }

    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().push(Call::Get(range));
        let total = self.len();

        let requested = range.filter(|_| self.ranges);
        let start = requested.map(|r| r.start).unwrap_or(0);

        if let Some(status) = self.take_status_fault(start) {
            return Ok(TransportResponse {
                head: self.head_for(url, status, Some(0)),
                body: stream::empty().boxed(),
            });
        }

        let mut head = self.head_for(url, 200, Some(total));
        let (start, end) = match requested {
            Some(r) if r.start >= total => {
                head.status = 416;
                head.content_range = Some(ContentRange {
                    range: None,
                    total: Some(total),
                });
                return Ok(TransportResponse {
                    head,
                    body: stream::empty().boxed(),
                });
            }
            Some(r) => {
                let end = r.end.unwrap_or(total - 1).min(total - 1);
                head.status = 206;
                head.content_length = Some(end - r.start + 1);
                head.content_range = Some(ContentRange {
                    range: Some((r.start, end)),
                    total: Some(total),
                });
                (r.start, end)
            }
            None if total == 0 => {
                return Ok(TransportResponse {
                    head,
                    body: stream::empty().boxed(),
                })
            }
            None => (0, total - 1),
        };

        let cut = self.take_cut_fault(start, end);
        let stop = cut.map(|(at, _)| at).unwrap_or(end + 1);
        let mut items: Vec<Result<Bytes, TransportError>> = self.body[start as usize..stop as usize]
            .chunks(self.chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some((_, false)) = cut {
            items.push(Err(TransportError::Body("connection reset by peer".to_string())));
        }

        let delay = self.chunk_delay;
        let body = stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        let body = match cut {
            Some((_, true)) => body.chain(stream::pending()).boxed(),
            _ => body.boxed(),
        };

        Ok(TransportResponse { head, body })
    }
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Config with short backoff so retry tests stay fast
pub fn test_config() -> EngineConfig {
    EngineConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        progress_interval_ms: 10,
        checkpoint_interval_secs: 1,
        event_queue_capacity: 4096,
        ..EngineConfig::default()
    }
}

/// Collect events for `id` until its terminal event arrives
pub async fn collect_until_terminal(
    events: &mut EventSubscriber,
    id: DownloadId,
) -> Vec<EngineEvent> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if event.download_id() != id {
                continue;
            }
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
        seen
    };

    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .expect("download did not finish in time")
}

pub fn snapshots(events: &[EngineEvent]) -> Vec<ProgressSnapshot> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ProgressUpdated(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
        .collect()
}

/// bytes_completed always equals the sum of the segment counters and never
/// exceeds the known total
pub fn assert_snapshots_consistent(events: &[EngineEvent]) {
    for snapshot in snapshots(events) {
        let sum: u64 = snapshot.segments.iter().map(|s| s.bytes_written).sum();
        assert_eq!(snapshot.bytes_completed, sum, "snapshot {:?}", snapshot);
        if let Some(total) = snapshot.total_bytes {
            assert!(snapshot.bytes_completed <= total, "snapshot {:?}", snapshot);
        }
    }
}
