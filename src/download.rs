//! Snapshot download pipeline.
//!
//! Fetches published document snapshots (e.g., templates to seed a new
//! workspace) over an injectable [`ResourceFetcher`]. The download runs
//! through a [`RetryingEffect`], so a rapid series of requests settles on
//! the last URL and transient fetch failures retry with backoff.

use std::sync::Arc;

use crate::effect::{BackoffPolicy, RetryingEffect};
use crate::error::Result;
use crate::transport::BoxFuture;

/// Fetches raw bytes for a URL.
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the resource at `url` in full.
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Retrying downloader for published document snapshots.
///
/// State is polled, not awaited: the UI layer reads
/// [`is_downloading`](SnapshotDownloader::is_downloading) and
/// [`data`](SnapshotDownloader::data) on its own cadence.
pub struct SnapshotDownloader {
    effect: RetryingEffect<String, Vec<u8>>,
}

impl SnapshotDownloader {
    /// Create a downloader over `fetcher` with the given retry policy.
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, policy: BackoffPolicy) -> Self {
        let effect = RetryingEffect::new(
            move |url: String| {
                let fetcher = Arc::clone(&fetcher);
                Box::pin(async move { fetcher.fetch(&url).await }) as BoxFuture<'static, Result<Vec<u8>>>
            },
            policy,
        );
        Self { effect }
    }

    /// Start downloading `url`, superseding any download in flight.
    pub fn download(&self, url: impl Into<String>) {
        self.effect.trigger(url.into());
    }

    /// Abandon the download in flight, keeping any previous result.
    pub fn cancel(&self) {
        self.effect.cancel();
    }

    /// Whether a download is currently in flight.
    pub fn is_downloading(&self) -> bool {
        self.effect.state().in_progress
    }

    /// Bytes of the most recently completed download, if any.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.effect.state().result
    }

    /// Terminal error of the last download, if it exhausted its retries.
    pub fn error(&self) -> Option<String> {
        self.effect.state().error
    }
}
