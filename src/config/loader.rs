//! Configuration loading and live reload.
//!
//! The current snapshot sits behind an `ArcSwap`: readers grab a plain
//! `Arc` without locking and keep it for the whole evaluation, writers
//! publish whole snapshots. Reloading is a background task that asks a
//! [`ConfigSource`] for fresh snapshots on a fixed interval.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

use crate::config::RateLimitConfig;
use crate::error::Result;

/// Produces configuration snapshots.
///
/// Closures returning futures implement this, so inline sources work:
///
/// ```ignore
/// let source = || async { Ok(RateLimitConfig::new("svc")) };
/// ```
pub trait ConfigSource: Send + Sync + 'static {
    /// Load a fresh snapshot.
    fn load(&self) -> impl Future<Output = Result<RateLimitConfig>> + Send;
}

impl<F, Fut> ConfigSource for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RateLimitConfig>> + Send,
{
    fn load(&self) -> impl Future<Output = Result<RateLimitConfig>> + Send {
        self()
    }
}

/// Shared handle to the current configuration snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<RateLimitConfig>>,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("unique_name", &self.current().unique_name().to_string())
            .finish()
    }
}

impl ConfigHandle {
    /// Create a handle holding the given snapshot.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// The current snapshot. Lock-free; callers keep the returned `Arc`
    /// for the duration of one evaluation.
    pub fn current(&self) -> Arc<RateLimitConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, config: RateLimitConfig) {
        self.inner.store(Arc::new(config));
    }
}

/// Spawn the reload task.
///
/// Every `interval` the source is asked for a new snapshot; successes
/// are published, failures are logged and the last good snapshot stays.
/// The task stops when `shutdown` is notified; a snapshot that finishes
/// loading after `disposed` was set is discarded instead of published.
pub fn spawn_reload<C: ConfigSource>(
    handle: ConfigHandle,
    source: C,
    interval: Duration,
    shutdown: Arc<Notify>,
    disposed: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match source.load().await {
                        Ok(config) => {
                            if disposed.load(Ordering::SeqCst) {
                                tracing::debug!("discarding configuration loaded after dispose");
                                break;
                            }
                            tracing::debug!(
                                unique_name = config.unique_name(),
                                rules = config.rules().len(),
                                "published new rate limit configuration"
                            );
                            handle.publish(config);
                        }
                        Err(err) => {
                            tracing::warn!(
                                error = %err,
                                "configuration reload failed, keeping last good snapshot"
                            );
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, RateLimitError};
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_handle_publish_replaces_snapshot() {
        let handle = ConfigHandle::new(RateLimitConfig::new("one"));
        assert_eq!(handle.current().unique_name(), "one");

        handle.publish(RateLimitConfig::new("two"));
        assert_eq!(handle.current().unique_name(), "two");
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let handle = ConfigHandle::new(RateLimitConfig::new("one"));
        let held = handle.current();

        handle.publish(RateLimitConfig::new("two"));

        // The held reference still sees the old snapshot.
        assert_eq!(held.unique_name(), "one");
        assert_eq!(handle.current().unique_name(), "two");
    }

    #[tokio::test]
    async fn test_reload_publishes_new_snapshots() {
        let loads = Arc::new(AtomicU64::new(0));
        let source = {
            let loads = loads.clone();
            move || {
                let n = loads.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, RateLimitError>(RateLimitConfig::new(format!("gen-{}", n))) }
            }
        };

        let handle = ConfigHandle::new(RateLimitConfig::new("gen-0"));
        let shutdown = Arc::new(Notify::new());
        let disposed = Arc::new(AtomicBool::new(false));
        let task = spawn_reload(
            handle.clone(),
            source,
            Duration::from_millis(20),
            shutdown.clone(),
            disposed,
        );

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_ne!(handle.current().unique_name(), "gen-0");

        shutdown.notify_waiters();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_last_good() {
        let source = || async {
            Err::<RateLimitConfig, _>(RateLimitError::from(ConfigError::Load(
                "source unavailable".into(),
            )))
        };

        let handle = ConfigHandle::new(RateLimitConfig::new("good"));
        let shutdown = Arc::new(Notify::new());
        let disposed = Arc::new(AtomicBool::new(false));
        let task = spawn_reload(
            handle.clone(),
            source,
            Duration::from_millis(10),
            shutdown.clone(),
            disposed,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.current().unique_name(), "good");

        shutdown.notify_waiters();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_reloads() {
        let loads = Arc::new(AtomicU64::new(0));
        let source = {
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RateLimitError>(RateLimitConfig::new("svc")) }
            }
        };

        let handle = ConfigHandle::new(RateLimitConfig::new("svc"));
        let shutdown = Arc::new(Notify::new());
        let disposed = Arc::new(AtomicBool::new(false));
        let task = spawn_reload(
            handle,
            source,
            Duration::from_millis(10),
            shutdown.clone(),
            disposed,
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.notify_waiters();
        task.await.unwrap();

        let after_shutdown = loads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(loads.load(Ordering::SeqCst), after_shutdown);
    }
}
