//! lightbox-core: concurrency core for an image browsing application.
//!
//! Four cooperating pieces:
//! - [`RequestScheduler`]: priority thumbnail generation with a single serial
//!   worker, batch yields, and scrolling backpressure.
//! - [`BoundedLruCache`]: fixed-capacity thumbnail cache with LRU eviction.
//! - [`SlidingWindowCache`]: full-resolution preloads around the current view
//!   position.
//! - [`ConcurrentStore`]: bounded-reader / exclusive-writer envelope over the
//!   embedded catalog database, with transient-busy retry.
//!
//! Cancellation is cooperative throughout, carried by [`CancellationToken`].
//! The host supplies the actual pixel work ([`ItemProcessor`], [`ImageLoader`])
//! and the SQL; this crate owns the scheduling, caching, and locking around it.

pub mod cancel;
pub mod lru;
pub mod scheduler;
pub mod store;
pub mod testlib;
pub mod window;

pub use cancel::CancellationToken;
pub use lru::BoundedLruCache;
pub use scheduler::{
    CompletionCallback, ItemFailureTracker, ItemProcessor, ProcessError, RequestScheduler,
    SchedulerConfig, SchedulerStats, ThumbnailRequest,
};
pub use store::{
    ConcurrentStore, OpKind, StoreConfig, StoreError, StoreStats, TransientClassifier,
};
pub use window::{ImageLoader, LoadError, SlidingWindowCache, WindowItem};
