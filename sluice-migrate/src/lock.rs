//! Cross-process locking of the schema history.
//!
//! A [`LockPrimitive`] is a non-blocking, database-native mutex (a sentinel
//! row, an advisory lock). The [`LockCoordinator`] turns it into a blocking
//! acquisition with exponential backoff and a retry budget, and guarantees
//! release on every exit path of the critical section.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{MigrateResult, MigrationError};

/// Non-blocking mutual exclusion scoped to one schema history.
#[async_trait::async_trait]
pub trait LockPrimitive: Send + Sync {
    /// Try to take the lock. Returns `false` when someone else holds it.
    async fn try_acquire(&self) -> MigrateResult<bool>;

    /// Release a lock taken by this primitive.
    async fn release(&self) -> MigrateResult<()>;
}

/// Backoff schedule between lock attempts.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    current_ms: u64,
    exponent: f64,
    max_ms: u64,
    retries: i32,
    used: i32,
}

impl RetryStrategy {
    /// Create a strategy; `retries == -1` retries forever.
    pub fn new(initial_ms: u64, exponent: f64, max_ms: u64, retries: i32) -> Self {
        Self {
            current_ms: initial_ms.min(max_ms),
            exponent,
            max_ms,
            retries,
            used: 0,
        }
    }

    /// Build a strategy from lock settings.
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(
            config.initial_interval_ms,
            config.backoff_exponent,
            config.max_interval_ms,
            config.retries,
        )
    }

    /// Whether the budget allows another retry.
    pub fn has_more_retries(&self) -> bool {
        self.retries == LockConfig::UNLIMITED || self.used < self.retries
    }

    /// Return the current wait and grow the next one.
    pub fn next(&mut self) -> Duration {
        let wait = self.current_ms;
        let grown = (self.current_ms as f64 * self.exponent).round();
        self.current_ms = if grown >= self.max_ms as f64 {
            self.max_ms
        } else {
            grown as u64
        };
        self.used = self.used.saturating_add(1);
        Duration::from_millis(wait)
    }
}

/// Held lock. Dropping it without [`LockGuard::release`] still releases the
/// primitive on a background task.
pub struct LockGuard {
    primitive: Arc<dyn LockPrimitive>,
    released: bool,
}

impl LockGuard {
    fn new(primitive: Arc<dyn LockPrimitive>) -> Self {
        Self {
            primitive,
            released: false,
        }
    }

    /// Release the lock now.
    pub async fn release(mut self) -> MigrateResult<()> {
        self.released = true;
        self.primitive.release().await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let primitive = Arc::clone(&self.primitive);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = primitive.release().await {
                        warn!(error = %e, "Failed to release schema history lock");
                    }
                });
            }
            Err(_) => warn!("Schema history lock dropped outside a runtime; it will expire"),
        }
    }
}

/// Serializes critical sections across processes.
#[derive(Clone)]
pub struct LockCoordinator {
    primitive: Arc<dyn LockPrimitive>,
    config: LockConfig,
    cancel: CancellationToken,
}

impl LockCoordinator {
    /// Create a coordinator for the given primitive.
    pub fn new(primitive: Arc<dyn LockPrimitive>, config: LockConfig) -> Self {
        Self {
            primitive,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Interrupt lock waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Acquire the lock, waiting with backoff while it is contested.
    pub async fn acquire(&self) -> MigrateResult<LockGuard> {
        let mut strategy = RetryStrategy::from_config(&self.config);
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::LockInterrupted);
            }
            attempts += 1;
            if self.primitive.try_acquire().await? {
                debug!(attempts, "Acquired schema history lock");
                return Ok(LockGuard::new(Arc::clone(&self.primitive)));
            }
            if !strategy.has_more_retries() {
                warn!(attempts, "Giving up on schema history lock");
                return Err(MigrationError::LockTimeout { attempts });
            }

            let wait = strategy.next();
            debug!(
                attempts,
                wait_ms = wait.as_millis() as u64,
                "Schema history lock is held elsewhere, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrationError::LockInterrupted),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Run `section` with the lock held, releasing it afterwards whatever the outcome.
    pub async fn with_lock<F, Fut, T>(&self, section: F) -> MigrateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MigrateResult<T>>,
    {
        let guard = self.acquire().await?;
        let result = section().await;
        let released = guard.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release schema history lock");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}

/// Lock primitive for a single process.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: AtomicBool,
}

impl InMemoryLock {
    /// Create an unlocked primitive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock is currently held.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl LockPrimitive for InMemoryLock {
    async fn try_acquire(&self) -> MigrateResult<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release(&self) -> MigrateResult<()> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast(retries: i32) -> LockConfig {
        LockConfig::fast().retries(retries)
    }

    #[test]
    fn test_retry_strategy_sequence() {
        let mut strategy = RetryStrategy::new(100, 2.0, 500, 10);
        let waits: Vec<u64> = (0..5).map(|_| strategy.next().as_millis() as u64).collect();
        assert_eq!(waits, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_retry_budget() {
        let mut strategy = RetryStrategy::new(1, 1.0, 1, 2);
        assert!(strategy.has_more_retries());
        strategy.next();
        strategy.next();
        assert!(!strategy.has_more_retries());

        let mut unlimited = RetryStrategy::new(1, 1.0, 1, LockConfig::UNLIMITED);
        for _ in 0..1000 {
            unlimited.next();
        }
        assert!(unlimited.has_more_retries());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_success_and_error() {
        let lock = Arc::new(InMemoryLock::new());
        let coordinator = LockCoordinator::new(lock.clone(), fast(0));

        let value = coordinator
            .with_lock(|| async {
                assert!(lock.is_held());
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!lock.is_held());

        let err = coordinator
            .with_lock(|| async { Err::<(), _>(MigrationError::other("boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_timeout_after_budget() {
        let lock = Arc::new(InMemoryLock::new());
        assert!(lock.try_acquire().await.unwrap());

        let coordinator = LockCoordinator::new(lock.clone(), fast(3));
        let err = coordinator.acquire().await.err().unwrap();
        assert!(matches!(err, MigrationError::LockTimeout { attempts: 4 }));
        assert!(lock.is_held());
    }

    #[tokio::test]
    async fn test_interrupted_while_waiting() {
        let lock = Arc::new(InMemoryLock::new());
        assert!(lock.try_acquire().await.unwrap());

        let token = CancellationToken::new();
        let coordinator = LockCoordinator::new(lock.clone(), fast(LockConfig::UNLIMITED))
            .with_cancellation(token.clone());
        let waiter = tokio::spawn(async move { coordinator.acquire().await.err() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let err = waiter.await.unwrap().unwrap();
        assert!(matches!(err, MigrationError::LockInterrupted));
    }

    #[tokio::test]
    async fn test_waits_for_release() {
        let lock = Arc::new(InMemoryLock::new());
        assert!(lock.try_acquire().await.unwrap());

        let releaser = lock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release().await.unwrap();
        });

        let coordinator = LockCoordinator::new(lock.clone(), fast(LockConfig::UNLIMITED));
        coordinator.with_lock(|| async { Ok(()) }).await.unwrap();
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_sections_never_overlap() {
        let lock = Arc::new(InMemoryLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..4 {
            let coordinator = LockCoordinator::new(lock.clone(), fast(LockConfig::UNLIMITED));
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .with_lock(|| async {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let lock = Arc::new(InMemoryLock::new());
        let coordinator = LockCoordinator::new(lock.clone(), fast(0));
        let guard = coordinator.acquire().await.unwrap();
        assert!(lock.is_held());
        drop(guard);

        for _ in 0..50 {
            if !lock.is_held() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_held());
    }
}
