//! Fills the gaps in a `Pane` by downloading missing chunks from a remote
//! source and verifying them against the reference tree as they land.
//!
//! The concurrency shape follows the download manager in the storage-hub
//! pack example: a semaphore bounds concurrent runs, a concurrent set
//! tracks in-flight chunk ownership, and each run retries its download
//! with exponential backoff before giving up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::Semaphore;

use crate::error::{PaintError, PaneError};
use crate::geometry::ChunkGeometry;
use crate::pane::PaneCapability;

/// A contiguous byte range to fetch from the remote source in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTransfer {
    pub start_offset: u64,
    pub end_offset: u64,
    pub chunk_lo: u32,
    pub chunk_hi: u32,
}

impl NodeTransfer {
    pub fn len(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.start_offset == self.end_offset
    }
}

/// The remote data source a `Painter` downloads from. One implementation
/// per transport (HTTP range requests, a local mirror, a test double);
/// `async-trait` makes it usable as `Arc<dyn RemoteTransport>`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn download_range(&self, start: u64, length: u64) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// The event kinds a `Painter` emits, each carrying the chunk it concerns
/// (`None` for the two paint-level bookkeeping events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintEvent {
    PaintStart { start: u64, end: u64 },
    PaintDone { start: u64, end: u64 },
    ChunkDownloadStart { chunk_index: u32 },
    ChunkDownloadOk { chunk_index: u32 },
    ChunkDownloadFail { chunk_index: u32 },
    ChunkVerifyStart { chunk_index: u32 },
    ChunkVerifyOk { chunk_index: u32 },
    ChunkVerifyFail { chunk_index: u32 },
}

/// Sink for paint progress events. Implementations must not block; slow
/// work belongs on the other side of a channel.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PaintEvent);
}

/// Default sink: discards every event.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: PaintEvent) {}
}

/// Collects events in order, for tests that assert on emission sequence.
#[derive(Default)]
pub struct CollectingEventSink {
    events: parking_lot::Mutex<Vec<PaintEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PaintEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: PaintEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PainterConfig {
    /// Caps how many bytes a single download request spans; a run longer
    /// than this is split into several requests. `None` means no cap: a
    /// run is issued as a single request no matter how large.
    pub max_transfer_size: Option<u64>,
    /// Total download attempts per run before giving up (1 means no retry).
    pub max_retries: u32,
    /// Base of the doubling backoff schedule: `base_backoff * 2^attempt`.
    pub base_backoff: Duration,
    /// How many runs may download concurrently.
    pub max_concurrent_runs: usize,
}

impl Default for PainterConfig {
    fn default() -> Self {
        PainterConfig {
            max_transfer_size: Some(16 << 20),
            max_retries: 4,
            base_backoff: Duration::from_millis(100),
            max_concurrent_runs: 4,
        }
    }
}

/// Outcome of one `paint` call: counts, not individual chunk indices,
/// since a caller watching events already has those.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaintReport {
    pub chunks_verified: u32,
    pub chunks_verify_failed: u32,
    pub chunks_download_failed: u32,
    pub bytes_downloaded: u64,
}

/// Cooperative cancellation signal, checked at chunk boundaries inside a
/// running `paint` call. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Plans maximal contiguous runs of chunks that are currently missing
/// (not `pane.is_chunk_intact`), split so no single transfer exceeds
/// `max_transfer_size`. Exposed at crate-internal visibility so its
/// coalescing logic is directly unit-testable without a full `paint`
/// call or a real transport. `Painter::claim_runs` duplicates this logic
/// for the runtime path, additionally claiming in-flight ownership.
#[cfg(test)]
pub(crate) async fn plan_transfers(
    geometry: &ChunkGeometry,
    pane: &dyn PaneCapability,
    lo: u32,
    hi: u32,
    max_transfer_size: Option<u64>,
) -> Vec<NodeTransfer> {
    let mut transfers = Vec::new();
    let mut run_start: Option<u32> = None;

    let mut i = lo;
    while i <= hi {
        let missing = i < hi && !pane.is_chunk_intact(i).await;
        match (missing, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                push_split(geometry, &mut transfers, start, i, max_transfer_size);
                run_start = None;
            }
            _ => {}
        }
        i += 1;
    }
    if let Some(start) = run_start {
        push_split(geometry, &mut transfers, start, hi, max_transfer_size);
    }
    transfers
}

fn push_split(
    geometry: &ChunkGeometry,
    out: &mut Vec<NodeTransfer>,
    run_chunk_lo: u32,
    run_chunk_hi_exclusive: u32,
    max_transfer_size: Option<u64>,
) {
    let mut chunk = run_chunk_lo;
    while chunk < run_chunk_hi_exclusive {
        let start_offset = geometry.boundary(chunk).unwrap().start_inclusive;
        let mut last = chunk;
        loop {
            let next = last + 1;
            if next >= run_chunk_hi_exclusive {
                break;
            }
            if let Some(cap) = max_transfer_size {
                let candidate_end = geometry.boundary(next).unwrap().end_exclusive;
                if candidate_end - start_offset > cap {
                    break;
                }
            }
            last = next;
        }
        let end_offset = geometry.boundary(last).unwrap().end_exclusive;
        out.push(NodeTransfer {
            start_offset,
            end_offset,
            chunk_lo: chunk,
            chunk_hi: last + 1,
        });
        chunk = last + 1;
    }
}

/// Fills gaps in a pane by downloading from a remote transport and
/// verifying against the reference tree. Holds the pane behind an `Arc`
/// (rather than a borrow) so its per-run tasks can be real `tokio::spawn`
/// tasks instead of futures polled on the caller's task; many painters,
/// or repeated calls on one painter, can share the same long-lived pane.
pub struct Painter {
    pane: Arc<dyn PaneCapability>,
    transport: Arc<dyn RemoteTransport>,
    sink: Arc<dyn EventSink>,
    config: PainterConfig,
    in_flight: Arc<DashSet<u32>>,
    run_semaphore: Arc<Semaphore>,
}

impl Painter {
    pub fn new(
        pane: Arc<dyn PaneCapability>,
        transport: Arc<dyn RemoteTransport>,
        sink: Arc<dyn EventSink>,
        config: PainterConfig,
    ) -> Self {
        Painter {
            pane,
            transport,
            sink,
            run_semaphore: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            in_flight: Arc::new(DashSet::new()),
            config,
        }
    }

    /// Downloads and verifies every missing chunk overlapping the
    /// half-open byte range `[start, end)`. Resolves once every chunk in
    /// range is either verified or its download/verification has been
    /// recorded as failed in the returned report.
    pub async fn paint(&self, start: u64, end: u64) -> Result<PaintReport, PaintError> {
        self.paint_cancellable(start, end, &CancelToken::new()).await
    }

    pub async fn paint_cancellable(
        &self,
        start: u64,
        end: u64,
        cancel: &CancelToken,
    ) -> Result<PaintReport, PaintError> {
        let geometry = *self.pane.geometry();
        if start >= end || geometry.total_size() == 0 {
            return Ok(PaintReport::default());
        }

        let hi_pos = std::cmp::min(end, geometry.total_size()) - 1;
        let c_lo = geometry.chunk_for_position(start).map_err(PaneError::from)?;
        let c_hi_inclusive = geometry.chunk_for_position(hi_pos).map_err(PaneError::from)?;

        let runs = self.claim_runs(&geometry, c_lo, c_hi_inclusive + 1).await;
        if runs.is_empty() {
            // Entirely intact range: resolves immediately, no transfer, no events.
            return Ok(PaintReport::default());
        }

        self.sink.emit(PaintEvent::PaintStart { start, end });

        let report = Arc::new(std::sync::Mutex::new(PaintReport::default()));
        let fatal: Arc<tokio::sync::Mutex<Option<PaintError>>> = Arc::new(tokio::sync::Mutex::new(None));

        let mut set = tokio::task::JoinSet::new();
        for run in runs {
            if cancel.is_cancelled() {
                self.release_run(&run);
                continue;
            }
            let permit = Arc::clone(&self.run_semaphore);
            let pane = Arc::clone(&self.pane);
            let transport = Arc::clone(&self.transport);
            let sink = Arc::clone(&self.sink);
            let in_flight = Arc::clone(&self.in_flight);
            let config = self.config;
            let cancel = cancel.clone();
            let report = Arc::clone(&report);
            let fatal = Arc::clone(&fatal);

            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                run_one(run, pane, transport, sink, in_flight, config, cancel, report, fatal).await;
            });
        }

        while set.join_next().await.is_some() {}

        if let Some(e) = fatal.lock().await.take() {
            return Err(e);
        }

        self.sink.emit(PaintEvent::PaintDone { start, end });
        let final_report = *report.lock().unwrap();
        Ok(final_report)
    }

    /// Like `plan_transfers`, but additionally claims ownership of every
    /// chunk it includes in a run (breaking a run early if a chunk is
    /// already owned by another in-flight painter).
    async fn claim_runs(&self, geometry: &ChunkGeometry, lo: u32, hi: u32) -> Vec<NodeTransfer> {
        let mut transfers = Vec::new();
        let mut run_start: Option<u32> = None;

        let mut i = lo;
        while i < hi {
            let available = !self.pane.is_chunk_intact(i).await && self.in_flight.insert(i);
            match (available, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    self.split_and_push(geometry, &mut transfers, start, i);
                    run_start = None;
                }
                _ => {}
            }
            i += 1;
        }
        if let Some(start) = run_start {
            self.split_and_push(geometry, &mut transfers, start, hi);
        }
        transfers
    }

    fn split_and_push(
        &self,
        geometry: &ChunkGeometry,
        out: &mut Vec<NodeTransfer>,
        run_chunk_lo: u32,
        run_chunk_hi_exclusive: u32,
    ) {
        push_split(geometry, out, run_chunk_lo, run_chunk_hi_exclusive, self.config.max_transfer_size);
    }

    fn release_run(&self, run: &NodeTransfer) {
        for i in run.chunk_lo..run.chunk_hi {
            self.in_flight.remove(&i);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    run: NodeTransfer,
    pane: Arc<dyn PaneCapability>,
    transport: Arc<dyn RemoteTransport>,
    sink: Arc<dyn EventSink>,
    in_flight: Arc<DashSet<u32>>,
    config: PainterConfig,
    cancel: CancelToken,
    report: Arc<std::sync::Mutex<PaintReport>>,
    fatal: Arc<tokio::sync::Mutex<Option<PaintError>>>,
) {
    if cancel.is_cancelled() {
        for i in run.chunk_lo..run.chunk_hi {
            in_flight.remove(&i);
        }
        return;
    }

    for i in run.chunk_lo..run.chunk_hi {
        sink.emit(PaintEvent::ChunkDownloadStart { chunk_index: i });
    }

    let payload = download_with_retry(&*transport, run.start_offset, run.len(), config).await;

    let payload = match payload {
        Ok(bytes) => bytes,
        Err(_) => {
            for i in run.chunk_lo..run.chunk_hi {
                sink.emit(PaintEvent::ChunkDownloadFail { chunk_index: i });
                in_flight.remove(&i);
            }
            report.lock().unwrap().chunks_download_failed += run.chunk_hi - run.chunk_lo;
            return;
        }
    };

    for i in run.chunk_lo..run.chunk_hi {
        sink.emit(PaintEvent::ChunkDownloadOk { chunk_index: i });
    }
    report.lock().unwrap().bytes_downloaded += payload.len() as u64;

    let geometry = *pane.geometry();
    for i in run.chunk_lo..run.chunk_hi {
        if cancel.is_cancelled() {
            in_flight.remove(&i);
            continue;
        }

        let boundary = match geometry.boundary(i) {
            Ok(b) => b,
            Err(e) => {
                *fatal.lock().await = Some(PaintError::Pane(PaneError::from(e)));
                in_flight.remove(&i);
                continue;
            }
        };
        let lo = (boundary.start_inclusive - run.start_offset) as usize;
        let hi = (boundary.end_exclusive - run.start_offset) as usize;
        let slice = payload[lo..hi].to_vec();

        sink.emit(PaintEvent::ChunkVerifyStart { chunk_index: i });
        match pane.submit_chunk(i, slice).await {
            Ok(()) => {
                sink.emit(PaintEvent::ChunkVerifyOk { chunk_index: i });
                report.lock().unwrap().chunks_verified += 1;
            }
            Err(PaneError::VerifyFailed { .. }) => {
                sink.emit(PaintEvent::ChunkVerifyFail { chunk_index: i });
                report.lock().unwrap().chunks_verify_failed += 1;
            }
            Err(e) => {
                *fatal.lock().await = Some(e.into());
            }
        }
        in_flight.remove(&i);
    }
}

async fn download_with_retry(
    transport: &dyn RemoteTransport,
    start: u64,
    length: u64,
    config: PainterConfig,
) -> Result<Vec<u8>, TransportError> {
    let mut attempt = 0;
    loop {
        match transport.download_range(start, length).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff = config.base_backoff * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Painter>();
}
