//! Backpressure accounting for outbound pages.
//!
//! Every page handed to the writer task holds one slot until it has been
//! written to the transport. Producers wait (with a timeout) while all slots
//! are taken, so a slow or stalled peer cannot grow the outbound queue
//! without bound.
//!
//! ```text
//! send_event ─► reserve() ─► mpsc ─► writer task ─► release_many(n)
//!                  ▲                                      │
//!                  └──────────── pending counter ◄────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DockError, Result};

/// Default maximum pending pages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default time to wait for a free slot.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Lock-free counter of pages queued but not yet written.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: max_pending.max(1),
            timeout,
        }
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Take a slot without waiting.
    pub fn try_reserve(&self) -> Result<()> {
        self.try_reserve_many(1)
    }

    /// Take `count` slots at once, or none.
    ///
    /// A request larger than the limit is admitted only while nothing is
    /// pending.
    pub fn try_reserve_many(&self, count: usize) -> Result<()> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current > 0 && current + count > self.max_pending {
                return Err(DockError::BackpressureTimeout);
            }
            match self.pending.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Take a slot, waiting up to the configured timeout.
    pub async fn reserve(&self) -> Result<()> {
        self.reserve_many(1).await
    }

    /// Take `count` slots, waiting up to the configured timeout.
    pub async fn reserve_many(&self, count: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.try_reserve_many(count).is_ok() {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                tracing::warn!(
                    "backpressure timeout with {} pages pending",
                    self.pending_count()
                );
                return Err(DockError::BackpressureTimeout);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Wait until every reserved page has been written.
    ///
    /// Gives up after `timeout` with the number of pages still pending.
    pub async fn wait_idle(&self, timeout: Duration) -> std::result::Result<(), usize> {
        let start = Instant::now();
        loop {
            let pending = self.pending_count();
            if pending == 0 {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(pending);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release slots for a written batch.
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// Releases reserved slots on drop unless they were handed over.
///
/// Held across the channel send so a closed channel does not leak slots.
pub struct BackpressureGuard {
    controller: BackpressureController,
    count: usize,
}

impl BackpressureGuard {
    pub fn new(controller: BackpressureController) -> Self {
        Self::with_count(controller, 1)
    }

    pub fn with_count(controller: BackpressureController, count: usize) -> Self {
        Self { controller, count }
    }

    /// Slots still owned by the guard.
    pub fn remaining(&self) -> usize {
        self.count
    }

    /// Slots taken from the controller after the guard was created.
    pub fn add(&mut self, count: usize) {
        self.count += count;
    }

    /// One slot passed to the writer task.
    pub fn hand_over(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Ownership of every slot passed to the writer task.
    pub fn disarm(mut self) {
        self.count = 0;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if self.count > 0 {
            self.controller.release_many(self.count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_creation() {
        let ctrl = BackpressureController::new(100);
        assert_eq!(ctrl.max_pending(), 100);
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_zero_limit_still_admits_one() {
        let ctrl = BackpressureController::new(0);
        assert!(ctrl.try_reserve().is_ok());
        assert!(ctrl.try_reserve().is_err());
    }

    #[test]
    fn test_try_reserve_at_capacity() {
        let ctrl = BackpressureController::new(5);
        for _ in 0..5 {
            ctrl.try_reserve().unwrap();
        }

        assert_eq!(ctrl.pending_count(), ctrl.max_pending());
        assert!(matches!(
            ctrl.try_reserve(),
            Err(DockError::BackpressureTimeout)
        ));
    }

    #[test]
    fn test_release_many() {
        let ctrl = BackpressureController::new(100);
        for _ in 0..50 {
            ctrl.try_reserve().unwrap();
        }

        ctrl.release_many(30);
        assert_eq!(ctrl.pending_count(), 20);
        ctrl.release();
        assert_eq!(ctrl.pending_count(), 19);
    }

    #[test]
    fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::new(10);
        let ctrl2 = ctrl1.clone();

        ctrl1.try_reserve().unwrap();
        assert_eq!(ctrl2.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(10));
        ctrl.try_reserve().unwrap();

        let start = Instant::now();
        let result = ctrl.reserve().await;

        assert!(matches!(result, Err(DockError::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_wait_success() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(1));
        ctrl.try_reserve().unwrap();

        let releaser = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release();
        });

        assert!(ctrl.reserve().await.is_ok());
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let ctrl = BackpressureController::new(10);
        assert!(ctrl.wait_idle(Duration::from_millis(1)).await.is_ok());

        ctrl.try_reserve().unwrap();
        ctrl.try_reserve().unwrap();
        assert_eq!(ctrl.wait_idle(Duration::from_millis(5)).await, Err(2));

        ctrl.release_many(2);
        assert!(ctrl.wait_idle(Duration::from_millis(5)).await.is_ok());
    }

    #[test]
    fn test_guard_releases_unless_disarmed() {
        let ctrl = BackpressureController::new(10);

        ctrl.try_reserve().unwrap();
        drop(BackpressureGuard::new(ctrl.clone()));
        assert_eq!(ctrl.pending_count(), 0);

        ctrl.try_reserve().unwrap();
        BackpressureGuard::new(ctrl.clone()).disarm();
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[test]
    fn test_reserve_many_is_all_or_nothing() {
        let ctrl = BackpressureController::new(4);
        ctrl.try_reserve_many(3).unwrap();

        assert!(ctrl.try_reserve_many(2).is_err());
        assert_eq!(ctrl.pending_count(), 3);
        ctrl.try_reserve_many(1).unwrap();
        assert!(ctrl.try_reserve().is_err());
    }

    #[test]
    fn test_oversized_reservation_waits_for_idle() {
        let ctrl = BackpressureController::new(2);
        ctrl.try_reserve().unwrap();
        assert!(ctrl.try_reserve_many(5).is_err());

        ctrl.release();
        ctrl.try_reserve_many(5).unwrap();
        assert_eq!(ctrl.pending_count(), 5);
    }

    #[test]
    fn test_guard_releases_what_was_not_handed_over() {
        let ctrl = BackpressureController::new(10);
        ctrl.try_reserve_many(3).unwrap();

        let mut guard = BackpressureGuard::with_count(ctrl.clone(), 3);
        guard.hand_over();
        assert_eq!(guard.remaining(), 2);
        drop(guard);

        assert_eq!(ctrl.pending_count(), 1);
    }
}
