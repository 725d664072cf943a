// Concurrent store module
// Async envelope around an embedded single-writer SQLite catalog. Writers are
// mutually exclusive; readers run in parallel up to a bounded count. The
// actual SQL runs on blocking threads via spawn_blocking, each operation on a
// freshly opened connection, with transient busy/locked failures retried under
// exponential backoff.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};

use crate::cancel::CancellationToken;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The operation's cancellation token fired before or during the work.
    #[error("operation cancelled")]
    Cancelled,
    /// Read deadline elapsed. Distinct from cancellation so callers can tell
    /// a stuck database apart from their own abandonment.
    #[error("read timed out")]
    Timeout,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Decides whether a database error is a transient contention condition worth
/// retrying. Keeps the retry core storage-agnostic.
pub type TransientClassifier = Arc<dyn Fn(&rusqlite::Error) -> bool + Send + Sync>;

/// Default classifier: SQLite busy/locked result codes.
pub fn sqlite_busy_classifier(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// The five envelope kinds, used for log correlation and to pick the
/// transaction wrapping on the blocking thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    WriteWithResult,
    WriteTransaction,
    WriteTransactionWithResult,
}

impl OpKind {
    fn as_str(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::WriteWithResult => "write_with_result",
            OpKind::WriteTransaction => "write_transaction",
            OpKind::WriteTransactionWithResult => "write_transaction_with_result",
        }
    }

    fn is_transactional(self) -> bool {
        matches!(
            self,
            OpKind::Read | OpKind::WriteTransaction | OpKind::WriteTransactionWithResult
        )
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on concurrently executing readers.
    pub max_readers: usize,
    /// Total attempts per operation, first try included.
    pub max_attempts: u32,
    /// Backoff before attempt n+1 is `retry_base_delay * 2^(n-1)`.
    pub retry_base_delay: Duration,
    /// Wall-clock deadline for the whole read path.
    pub read_timeout: Duration,
    /// One-shot sleep a new reader takes when a writer is waiting.
    pub writer_yield: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_readers: 10,
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            read_timeout: Duration::from_secs(30),
            writer_yield: Duration::from_millis(10),
        }
    }
}

/// Live counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub active_reads: usize,
    pub active_writes: usize,
    pub pending_writes: usize,
}

/// Decrements a gauge when dropped, so counters stay honest even when a
/// future is dropped mid-operation (e.g. by the read timeout).
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrency envelope over the catalog database.
///
/// Each operation takes a caller function `FnMut(&Connection) -> rusqlite::Result<R>`
/// which runs on a blocking thread; it receives a bare connection and cannot
/// re-enter the store, so no lock here needs to be reentrant. `FnMut` because
/// a transient failure re-runs the same function on a fresh attempt.
pub struct ConcurrentStore {
    path: PathBuf,
    config: StoreConfig,
    classifier: TransientClassifier,
    read_permits: Semaphore,
    write_permit: Semaphore,
    guard: RwLock<()>,
    op_counter: AtomicU64,
    pending_writes: AtomicUsize,
    active_reads: AtomicUsize,
    active_writes: AtomicUsize,
}

impl ConcurrentStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, StoreConfig::default())
    }

    pub fn with_config(path: impl AsRef<Path>, config: StoreConfig) -> Self {
        Self::with_classifier(path, config, Arc::new(sqlite_busy_classifier))
    }

    pub fn with_classifier(
        path: impl AsRef<Path>,
        config: StoreConfig,
        classifier: TransientClassifier,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            read_permits: Semaphore::new(config.max_readers),
            write_permit: Semaphore::new(1),
            guard: RwLock::new(()),
            op_counter: AtomicU64::new(0),
            pending_writes: AtomicUsize::new(0),
            active_reads: AtomicUsize::new(0),
            active_writes: AtomicUsize::new(0),
            config,
            classifier,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            active_reads: self.active_reads.load(Ordering::SeqCst),
            active_writes: self.active_writes.load(Ordering::SeqCst),
            pending_writes: self.pending_writes.load(Ordering::SeqCst),
        }
    }

    /// Run a read. Bounded concurrency, deferred transaction for a consistent
    /// snapshot, and a wall-clock deadline on the whole path; when a writer is
    /// waiting, the reader yields once before proceeding.
    ///
    /// A timed-out read is abandoned, not interrupted: the in-flight attempt
    /// keeps running on its blocking thread and may still commit after the
    /// caller has seen `StoreError::Timeout`.
    pub async fn read<F, R>(&self, token: &CancellationToken, f: F) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::time::timeout(self.config.read_timeout, self.read_inner(token, f)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Run a mutation. Writers are serialized; readers drain first.
    pub async fn write<F>(&self, token: &CancellationToken, f: F) -> Result<(), StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<()> + Send + 'static,
    {
        self.write_inner(OpKind::Write, token, f).await
    }

    /// As `write`, but the caller function's value is returned.
    pub async fn write_with_result<F, R>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.write_inner(OpKind::WriteWithResult, token, f).await
    }

    /// As `write`, with the caller function wrapped in a transaction: any
    /// error rolls every statement back.
    pub async fn write_transaction<F>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<()> + Send + 'static,
    {
        self.write_inner(OpKind::WriteTransaction, token, f).await
    }

    /// As `write_transaction`, but the caller function's value is returned.
    pub async fn write_transaction_with_result<F, R>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.write_inner(OpKind::WriteTransactionWithResult, token, f)
            .await
    }

    async fn read_inner<F, R>(&self, token: &CancellationToken, f: F) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let op_id = self.next_op_id();
        let permit = tokio::select! {
            permit = self.read_permits.acquire() => {
                // The semaphore is never closed.
                permit.map_err(|_| StoreError::Cancelled)?
            }
            _ = token.cancelled() => return Err(StoreError::Cancelled),
        };
        // Soft writer preference: step aside once, then proceed regardless.
        if self.pending_writes.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.config.writer_yield).await;
        }
        let _active = GaugeGuard::enter(&self.active_reads);
        let _guard = self.guard.read().await;
        let result = self.run_with_retry(op_id, OpKind::Read, token, f).await;
        drop(permit);
        result
    }

    async fn write_inner<F, R>(
        &self,
        kind: OpKind,
        token: &CancellationToken,
        f: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let op_id = self.next_op_id();
        let permit = tokio::select! {
            permit = self.write_permit.acquire() => {
                // The semaphore is never closed.
                permit.map_err(|_| StoreError::Cancelled)?
            }
            _ = token.cancelled() => return Err(StoreError::Cancelled),
        };
        // Visible to arriving readers while we wait for them to drain.
        let pending = GaugeGuard::enter(&self.pending_writes);
        let _guard = self.guard.write().await;
        drop(pending);
        let _active = GaugeGuard::enter(&self.active_writes);
        let result = self.run_with_retry(op_id, kind, token, f).await;
        drop(permit);
        result
    }

    /// Shared attempt loop. The caller function is moved onto the blocking
    /// thread and handed back with the attempt's outcome so the next attempt
    /// can reuse it.
    async fn run_with_retry<F, R>(
        &self,
        op_id: u64,
        kind: OpKind,
        token: &CancellationToken,
        mut f: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let path = self.path.clone();
            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = Self::run_attempt(&path, kind, &mut f);
                (f, outcome)
            })
            .await?;
            f = returned;

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("op {op_id} {}: succeeded on attempt {attempt}", kind.as_str());
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.config.max_attempts && (self.classifier)(&e) => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "op {op_id} {}: transient failure on attempt {attempt}: {e}; \
                         retrying in {delay:?}",
                        kind.as_str()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(StoreError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "op {op_id} {}: failed on attempt {attempt}: {e}",
                        kind.as_str()
                    );
                    return Err(StoreError::Sqlite(e));
                }
            }
        }
    }

    /// One attempt on the blocking thread: open a connection, wrap in a
    /// transaction where the kind calls for it, run the caller function.
    fn run_attempt<F, R>(path: &Path, kind: OpKind, f: &mut F) -> rusqlite::Result<R>
    where
        F: FnMut(&Connection) -> rusqlite::Result<R>,
    {
        let mut conn = Connection::open(path)?;
        if kind.is_transactional() {
            let behavior = match kind {
                OpKind::Read => TransactionBehavior::Deferred,
                _ => TransactionBehavior::Immediate,
            };
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        } else {
            f(&conn)
        }
    }

    fn next_op_id(&self) -> u64 {
        self.op_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
