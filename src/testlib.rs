//! Test utilities for lightbox-core
// Shared by module tests, integration tests, and the demo binary. Not part of
// the stable API surface.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cancel::CancellationToken;
use crate::scheduler::{CompletionCallback, ItemProcessor, ProcessError};
use crate::store::{ConcurrentStore, StoreConfig};

/// Processor that records every index it is asked to produce, in order.
/// Individual indices can be configured to fail or panic; an optional per-item
/// delay makes request execution observable from the outside.
pub struct RecordingProcessor {
    processed: Mutex<Vec<usize>>,
    delay: Duration,
    failing: HashSet<usize>,
    panicking: HashSet<usize>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self {
            processed: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            failing: HashSet::new(),
            panicking: HashSet::new(),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn fail_at(mut self, indices: &[usize]) -> Self {
        self.failing.extend(indices.iter().copied());
        self
    }

    pub fn panic_at(mut self, indices: &[usize]) -> Self {
        self.panicking.extend(indices.iter().copied());
        self
    }

    /// Indices processed so far, in processing order.
    pub fn processed(&self) -> Vec<usize> {
        self.processed.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    /// Poll until at least `n` items were processed.
    ///
    /// # Panics
    /// Panics when `timeout` elapses first.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {n} processed items (got {})",
                    self.count()
                );
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Default for RecordingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemProcessor for RecordingProcessor {
    fn process_item(
        &self,
        index: usize,
        _token: CancellationToken,
    ) -> BoxFuture<'_, Result<(), ProcessError>> {
        async move {
            self.processed.lock().unwrap().push(index);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.panicking.contains(&index) {
                panic!("configured panic at index {index}");
            }
            if self.failing.contains(&index) {
                return Err(ProcessError::Decode(format!("configured failure at {index}")));
            }
            Ok(())
        }
        .boxed()
    }
}

/// Completion callback that forwards the success flag over a channel, so a
/// test can await a request's completion instead of sleeping.
pub fn completion_channel() -> (CompletionCallback, tokio::sync::mpsc::UnboundedReceiver<bool>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: CompletionCallback = Box::new(move |_request, success| {
        let _ = tx.send(success);
    });
    (callback, rx)
}

/// Fresh on-disk catalog database with fast retry timings for tests.
/// The `TempDir` must be kept alive for the store's lifetime.
pub fn temp_store() -> (tempfile::TempDir, ConcurrentStore) {
    temp_store_with(StoreConfig {
        retry_base_delay: Duration::from_millis(1),
        ..StoreConfig::default()
    })
}

pub fn temp_store_with(config: StoreConfig) -> (tempfile::TempDir, ConcurrentStore) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = ConcurrentStore::with_config(dir.path().join("catalog.db"), config);
    (dir, store)
}
