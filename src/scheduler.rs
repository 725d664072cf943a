// Thumbnail request scheduler module
// Two FIFO lanes (high / normal priority) feeding a single serial worker task.
// Strict priority: the high lane always wins the scheduling decision; a steady
// stream of high-priority requests can starve the normal lane indefinitely.
// Work is cooperative: the worker yields between items and batches and polls
// cancellation at every checkpoint, so a request can be abandoned between any
// two items without tearing anything down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::Notify;

use crate::cancel::CancellationToken;

/// Failure of a single item inside a request. I/O failures are worth retrying
/// by the host (a file may be mid-copy); anything else is permanent.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("processing failed: {0}")]
    Other(String),
}

impl ProcessError {
    pub fn is_io(&self) -> bool {
        matches!(self, ProcessError::Io(_))
    }
}

/// The host's decode/resize pipeline. Called once per index; expected to poll
/// the token at its own suspension points.
pub trait ItemProcessor: Send + Sync + 'static {
    fn process_item(
        &self,
        index: usize,
        token: CancellationToken,
    ) -> BoxFuture<'_, Result<(), ProcessError>>;
}

/// Invoked exactly once per request: on completion, cancellation, or failure.
/// `success == false` means the request was cut short (cancelled, dropped from
/// the queue, or aborted by scrolling); per-item failures alone do not make a
/// request unsuccessful.
pub type CompletionCallback = Box<dyn Fn(&ThumbnailRequest, bool) + Send + Sync>;

struct RequestSource {
    token: CancellationToken,
    on_complete: Option<CompletionCallback>,
}

/// A range of thumbnail indices to produce.
///
/// A freshly built request has one source (its caller's token and callback).
/// The optimizer may merge requests; the merged request keeps *every* source,
/// and completion fans out to all of them, so no caller is left unnotified.
pub struct ThumbnailRequest {
    start: usize,
    end: usize,
    high_priority: bool,
    token: CancellationToken,
    sources: Vec<RequestSource>,
}

impl ThumbnailRequest {
    /// Build a request for the inclusive range `[start, end]`.
    ///
    /// # Panics
    /// Panics if `start > end`.
    pub fn new(
        start: usize,
        end: usize,
        high_priority: bool,
        token: CancellationToken,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        assert!(start <= end, "request range must satisfy start <= end");
        Self {
            start,
            end,
            high_priority,
            token: token.clone(),
            sources: vec![RequestSource { token, on_complete }],
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    /// The signal handed to the item processor while this request runs.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A request is cancelled only when every caller behind it has cancelled.
    /// For an unmerged request that is simply its own token.
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.sources.iter().all(|s| s.token.is_cancelled())
    }

    /// Union of two requests from the same lane. The merged request gets a
    /// fresh execution token and the concatenation of both source lists.
    fn merge(a: ThumbnailRequest, b: ThumbnailRequest) -> ThumbnailRequest {
        let mut sources = a.sources;
        sources.extend(b.sources);
        ThumbnailRequest {
            start: a.start.min(b.start),
            end: a.end.max(b.end),
            high_priority: a.high_priority || b.high_priority,
            token: CancellationToken::new(),
            sources,
        }
    }

    /// Remove and return the sources matching `signal` (or already fired).
    fn take_matching_sources(&mut self, signal: &CancellationToken) -> Vec<RequestSource> {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for source in self.sources.drain(..) {
            if CancellationToken::same(&source.token, signal) || source.token.is_cancelled() {
                taken.push(source);
            } else {
                kept.push(source);
            }
        }
        self.sources = kept;
        taken
    }

    /// Invoke every source callback once. Panics from consumer callbacks are
    /// caught and logged here; they never reach the worker loop.
    fn complete(&self, success: bool) {
        for source in &self.sources {
            if let Some(cb) = &source.on_complete {
                if std::panic::catch_unwind(AssertUnwindSafe(|| cb(self, success))).is_err() {
                    error!(
                        "completion callback panicked for request [{}, {}]",
                        self.start, self.end
                    );
                }
            }
        }
    }

    /// Rebuild a standalone request around a detached source so its caller
    /// still gets a completion callback carrying the range it asked about.
    fn from_source(start: usize, end: usize, high_priority: bool, source: RequestSource) -> Self {
        ThumbnailRequest {
            start,
            end,
            high_priority,
            token: source.token.clone(),
            sources: vec![source],
        }
    }
}

impl fmt::Debug for ThumbnailRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailRequest")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("high_priority", &self.high_priority)
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Items processed between the longer batch yields.
    pub batch_size: usize,
    /// Yield after every item, keeping the host responsive.
    pub item_yield: Duration,
    /// Slightly longer yield after every batch.
    pub batch_yield: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_yield: Duration::from_millis(1),
            batch_yield: Duration::from_millis(10),
        }
    }
}

/// Snapshot of queue state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub high_queued: usize,
    pub normal_queued: usize,
    pub processing: bool,
    pub scrolling: bool,
}

/// Range of the in-flight request, kept for stats while the worker owns it.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    start: usize,
    end: usize,
    high_priority: bool,
}

struct Queues {
    high: VecDeque<ThumbnailRequest>,
    normal: VecDeque<ThumbnailRequest>,
    current: Option<InFlight>,
}

struct Shared {
    queues: Mutex<Queues>,
    scrolling: AtomicBool,
    notify: Notify,
    shutdown: CancellationToken,
    config: SchedulerConfig,
    processor: Arc<dyn ItemProcessor>,
}

/// Priority-aware scheduler with a single serial worker.
///
/// At most one request executes at any instant; everything else waits in one
/// of the two lanes. Dropping the scheduler shuts the worker down gracefully:
/// an in-flight request stops at its next checkpoint and reports
/// `success = false`.
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

impl RequestScheduler {
    /// Spawn the worker on the current tokio runtime with default tuning.
    pub fn new(processor: Arc<dyn ItemProcessor>) -> Self {
        Self::with_config(processor, SchedulerConfig::default())
    }

    pub fn with_config(processor: Arc<dyn ItemProcessor>, config: SchedulerConfig) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                current: None,
            }),
            scrolling: AtomicBool::new(false),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            config,
            processor,
        });
        tokio::spawn(Self::worker(Arc::clone(&shared)));
        Self { shared }
    }

    /// Append to the matching lane (FIFO within a lane) and wake the worker
    /// if it is idle.
    pub fn enqueue(&self, request: ThumbnailRequest) {
        {
            let mut q = self.lock_queues();
            debug!(
                "enqueue [{}, {}] {} (queued: high={}, normal={})",
                request.start,
                request.end,
                if request.high_priority { "high" } else { "normal" },
                q.high.len(),
                q.normal.len()
            );
            if request.high_priority {
                q.high.push_back(request);
            } else {
                q.normal.push_back(request);
            }
        }
        self.shared.notify.notify_one();
    }

    /// Remove every queued request whose cancellation signal matches `signal`
    /// or has already fired. The in-flight request is never interrupted here;
    /// it observes its own token at the next checkpoint.
    ///
    /// For merged requests only the matching sources are detached; the request
    /// stays queued while any other caller still wants it. Every detached
    /// caller gets its callback with `success = false`.
    pub fn cancel_requests(&self, signal: &CancellationToken) {
        let mut dropped: Vec<ThumbnailRequest> = Vec::new();
        {
            let mut q = self.lock_queues();
            let q = &mut *q;
            for lane in [&mut q.high, &mut q.normal] {
                let mut kept = VecDeque::with_capacity(lane.len());
                for mut request in lane.drain(..) {
                    for source in request.take_matching_sources(signal) {
                        dropped.push(ThumbnailRequest::from_source(
                            request.start,
                            request.end,
                            request.high_priority,
                            source,
                        ));
                    }
                    if !request.sources.is_empty() {
                        kept.push_back(request);
                    }
                }
                *lane = kept;
            }
        }
        // Callbacks run outside the queue lock so they may re-enter the
        // scheduler, e.g. to enqueue a replacement.
        for request in &dropped {
            request.complete(false);
        }
        if !dropped.is_empty() {
            debug!("cancelled {} queued request source(s)", dropped.len());
        }
    }

    /// Empty both lanes; the in-flight request is untouched. Removed requests
    /// complete with `success = false`.
    pub fn clear_queue(&self) {
        let removed: Vec<ThumbnailRequest> = {
            let mut q = self.lock_queues();
            let q = &mut *q;
            q.high.drain(..).chain(q.normal.drain(..)).collect()
        };
        for request in &removed {
            request.complete(false);
        }
        debug!("cleared queue ({} requests)", removed.len());
    }

    /// While scrolling, queued normal-priority work is presumed stale: setting
    /// `true` drops the entire normal lane with no notification, and the
    /// worker skips normal-priority work until the flag clears.
    pub fn set_scrolling(&self, scrolling: bool) {
        self.shared.scrolling.store(scrolling, Ordering::SeqCst);
        if scrolling {
            let dropped = {
                let mut q = self.lock_queues();
                std::mem::take(&mut q.normal)
            };
            if !dropped.is_empty() {
                debug!(
                    "scrolling: dropped {} normal-priority request(s)",
                    dropped.len()
                );
            }
        }
    }

    pub fn is_scrolling(&self) -> bool {
        self.shared.scrolling.load(Ordering::SeqCst)
    }

    /// Merge overlapping or adjacent (gap <= 1) requests within each lane into
    /// single wider requests. All sources of the merged inputs are kept, so
    /// every original callback still fires. After a pass each lane is ordered
    /// by start index.
    pub fn optimize_requests(&self) {
        let mut q = self.lock_queues();
        q.high = merge_lane(std::mem::take(&mut q.high));
        q.normal = merge_lane(std::mem::take(&mut q.normal));
        debug!(
            "optimized queues: high={}, normal={}",
            q.high.len(),
            q.normal.len()
        );
    }

    pub fn stats(&self) -> SchedulerStats {
        let q = self.lock_queues();
        SchedulerStats {
            high_queued: q.high.len(),
            normal_queued: q.normal.len(),
            processing: q.current.is_some(),
            scrolling: self.is_scrolling(),
        }
    }

    /// Stop the worker. Queued requests stay unprocessed; an in-flight request
    /// aborts at its next checkpoint and reports `success = false`.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.shared.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn worker(shared: Arc<Shared>) {
        loop {
            if shared.shutdown.is_cancelled() {
                return;
            }
            // Register for a wakeup before checking the queues so an enqueue
            // racing with the check is never lost.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut q = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
                let request = q.high.pop_front().or_else(|| q.normal.pop_front());
                if let Some(r) = &request {
                    q.current = Some(InFlight {
                        start: r.start,
                        end: r.end,
                        high_priority: r.high_priority,
                    });
                }
                request
            };

            match next {
                Some(request) => {
                    Self::execute(&shared, request).await;
                    let mut q = shared.queues.lock().unwrap_or_else(|e| e.into_inner());
                    q.current = None;
                    // Loop straight back to pull the next request, high first.
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = shared.shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    /// True when the request should stop before its next item.
    fn should_abort(shared: &Shared, request: &ThumbnailRequest) -> bool {
        shared.shutdown.is_cancelled()
            || request.is_cancelled()
            || (!request.high_priority && shared.scrolling.load(Ordering::SeqCst))
    }

    async fn execute(shared: &Shared, request: ThumbnailRequest) {
        debug!(
            "executing [{}, {}] {}",
            request.start,
            request.end,
            if request.high_priority { "high" } else { "normal" }
        );
        // Mirror caller-side cancellation onto the execution token. A merged
        // request runs under a fresh token, so without this an in-flight item
        // could never observe the signal mid-item once every caller cancels.
        // Shutdown fires the execution token too.
        let watcher = {
            let sources: Vec<CancellationToken> =
                request.sources.iter().map(|s| s.token.clone()).collect();
            let exec = request.token.clone();
            let shutdown = shared.shutdown.clone();
            tokio::spawn(async move {
                let all_sources_cancelled = async {
                    // Cancellation is permanent, so awaiting each in turn
                    // resolves exactly when the last live source fires.
                    for token in &sources {
                        token.cancelled().await;
                    }
                };
                tokio::select! {
                    _ = all_sources_cancelled => {}
                    _ = shutdown.cancelled() => {}
                }
                exec.cancel();
            })
        };
        let mut success = true;
        let mut index = request.start;
        let batch_size = shared.config.batch_size.max(1);

        'request: while index <= request.end {
            if Self::should_abort(shared, &request) {
                success = false;
                break 'request;
            }
            let batch_end = (index + batch_size - 1).min(request.end);
            while index <= batch_end {
                if Self::should_abort(shared, &request) {
                    success = false;
                    break 'request;
                }
                let work = shared.processor.process_item(index, request.token.clone());
                match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // Per-item failure: logged, the rest of the batch runs.
                        warn!("item {index} failed: {e}");
                    }
                    Err(_) => {
                        error!("item processor panicked at index {index}");
                    }
                }
                index += 1;
                tokio::time::sleep(shared.config.item_yield).await;
            }
            tokio::time::sleep(shared.config.batch_yield).await;
        }

        watcher.abort();
        if !success {
            debug!(
                "request [{}, {}] aborted at index {index}",
                request.start, request.end
            );
        }
        request.complete(success);
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sort by start index, then fold neighbours whose ranges overlap or sit at
/// most one index apart.
fn merge_lane(lane: VecDeque<ThumbnailRequest>) -> VecDeque<ThumbnailRequest> {
    let mut requests: Vec<ThumbnailRequest> = lane.into_iter().collect();
    requests.sort_by_key(|r| r.start);
    let mut merged: VecDeque<ThumbnailRequest> = VecDeque::with_capacity(requests.len());
    for request in requests {
        match merged.back() {
            Some(last) if request.start <= last.end.saturating_add(1) => {
                if let Some(last) = merged.pop_back() {
                    merged.push_back(ThumbnailRequest::merge(last, request));
                }
            }
            _ => merged.push_back(request),
        }
    }
    merged
}

/// Host-side bookkeeping for repeatedly failing items.
///
/// I/O failures are counted; the item becomes unrecoverable after
/// `max_io_failures` of them. Any non-I/O failure marks the item unrecoverable
/// at once. The host renders a placeholder for unrecoverable items instead of
/// re-requesting them forever.
#[derive(Debug)]
pub struct ItemFailureTracker {
    max_io_failures: u32,
    io_failures: HashMap<usize, u32>,
    unrecoverable: HashSet<usize>,
}

impl ItemFailureTracker {
    pub fn new(max_io_failures: u32) -> Self {
        Self {
            max_io_failures,
            io_failures: HashMap::new(),
            unrecoverable: HashSet::new(),
        }
    }

    /// Record a failure; returns true if the item just became unrecoverable.
    pub fn record_failure(&mut self, index: usize, error: &ProcessError) -> bool {
        if self.unrecoverable.contains(&index) {
            return false;
        }
        if error.is_io() {
            let count = self.io_failures.entry(index).or_insert(0);
            *count += 1;
            if *count >= self.max_io_failures {
                self.unrecoverable.insert(index);
                return true;
            }
            false
        } else {
            self.unrecoverable.insert(index);
            true
        }
    }

    /// A success wipes the failure history for the item.
    pub fn record_success(&mut self, index: usize) {
        self.io_failures.remove(&index);
        self.unrecoverable.remove(&index);
    }

    pub fn is_unrecoverable(&self, index: usize) -> bool {
        self.unrecoverable.contains(&index)
    }
}
