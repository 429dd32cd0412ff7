//! Time and disk budgets shared by every worker of a run.
//!
//! The time budget is the cooperative cancellation signal of the engine:
//! once the usable time is gone (or a shutdown signal arrived) nothing new
//! is started, but in-flight artifacts are allowed to finish.

use crate::github::RepositoryRef;
use crate::utils::errors::{BackupError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wall-clock budget for one run.
#[derive(Debug)]
pub struct TimeBudget {
    started: Instant,
    ceiling: Duration,
    safety_margin: Duration,
    cancel: CancellationToken,
}

impl TimeBudget {
    pub fn new(ceiling: Duration, safety_margin: Duration) -> Self {
        Self {
            started: Instant::now(),
            ceiling,
            safety_margin,
            cancel: CancellationToken::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left until the external ceiling.
    pub fn remaining(&self) -> Duration {
        self.ceiling.saturating_sub(self.elapsed())
    }

    /// Time left once the safety margin is set aside. Zero after cancellation.
    pub fn usable(&self) -> Duration {
        if self.cancel.is_cancelled() {
            return Duration::ZERO;
        }
        self.remaining().saturating_sub(self.safety_margin)
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Whether a repository expected to need at least `estimated_minimum`
    /// may still be started.
    pub fn should_start_next(&self, estimated_minimum: Duration) -> bool {
        !self.cancel.is_cancelled() && self.remaining() >= self.safety_margin + estimated_minimum
    }

    /// True once no new artifact may be started.
    pub fn is_exhausted(&self) -> bool {
        self.usable().is_zero()
    }

    /// Timeout for a single long operation (clone, fetch): a fraction of the
    /// usable time left.
    pub fn sub_timeout(&self, fraction: f64) -> Duration {
        self.usable().mul_f64(fraction.clamp(0.0, 1.0))
    }

    /// Stop starting new work (shutdown signal received).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sleep for `wait`, unless that would run past the usable time or the
    /// run gets cancelled meanwhile.
    pub async fn sleep_within(&self, wait: Duration) -> Result<()> {
        if wait > self.usable() {
            return Err(BackupError::Timeout(wait));
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = self.cancel.cancelled() => Err(BackupError::Cancelled),
        }
    }
}

/// Shared counter of local disk, in MiB, that concurrent repositories reserve
/// from before they start.
#[derive(Debug, Clone)]
pub struct DiskBudget {
    semaphore: Arc<Semaphore>,
    total_mib: u32,
}

impl DiskBudget {
    pub fn new(total_mib: u32) -> Self {
        let total_mib = total_mib.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(total_mib as usize)),
            total_mib,
        }
    }

    pub fn total_mib(&self) -> u32 {
        self.total_mib
    }

    pub fn available_mib(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Expected peak footprint of a repository: its reported size times
    /// `factor`, clamped so an oversized repository runs alone instead of
    /// never.
    pub fn estimate_mib(&self, repo: &RepositoryRef, factor: u32) -> u32 {
        let base = (repo.size_kib / 1024).max(1);
        let estimate = base.saturating_mul(factor.max(1) as u64);
        estimate.min(self.total_mib as u64) as u32
    }

    /// Wait until `mib` can be reserved. The reservation is released when the
    /// returned permit is dropped.
    pub async fn reserve(&self, mib: u32) -> Result<OwnedSemaphorePermit> {
        let mib = mib.clamp(1, self.total_mib);
        self.semaphore
            .clone()
            .acquire_many_owned(mib)
            .await
            .map_err(|e| BackupError::Artifact(format!("disk budget closed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(size_kib: u64) -> RepositoryRef {
        RepositoryRef::for_test("demo", size_kib)
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_start_next_respects_margin() {
        let budget = TimeBudget::new(Duration::from_secs(100), Duration::from_secs(10));
        assert!(budget.should_start_next(Duration::from_secs(20)));

        tokio::time::advance(Duration::from_secs(71)).await;
        // 29s left: below margin (10) + estimate (20)
        assert!(!budget.should_start_next(Duration::from_secs(20)));
        assert!(budget.should_start_next(Duration::from_secs(5)));
        assert_eq!(budget.usable(), Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_never_underflows() {
        let budget = TimeBudget::new(Duration::from_secs(5), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.is_exhausted());
        assert_eq!(budget.sub_timeout(0.5), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_timeout_is_fraction_of_usable_time() {
        let budget = TimeBudget::new(Duration::from_secs(110), Duration::from_secs(10));
        assert_eq!(budget.sub_timeout(0.5), Duration::from_secs(50));
        assert_eq!(budget.sub_timeout(2.0), Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_work() {
        let budget = TimeBudget::new(Duration::from_secs(600), Duration::from_secs(10));
        budget.cancel();
        assert!(!budget.should_start_next(Duration::ZERO));
        assert!(budget.is_exhausted());
        assert!(budget.sleep_within(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_within_refuses_to_cross_ceiling() {
        let budget = TimeBudget::new(Duration::from_secs(60), Duration::from_secs(10));
        assert!(matches!(
            budget.sleep_within(Duration::from_secs(55)).await,
            Err(BackupError::Timeout(_))
        ));
        assert!(budget.sleep_within(Duration::from_secs(30)).await.is_ok());
        assert_eq!(budget.remaining(), Duration::from_secs(30));
    }

    #[test]
    fn test_disk_estimate_is_clamped() {
        let disk = DiskBudget::new(1000);
        assert_eq!(disk.estimate_mib(&repo(0), 3), 3);
        assert_eq!(disk.estimate_mib(&repo(10 * 1024), 3), 30);
        assert_eq!(disk.estimate_mib(&repo(5_000 * 1024), 3), 1000);
    }

    #[tokio::test]
    async fn test_disk_reservation_released_on_drop() {
        let disk = DiskBudget::new(100);
        let permit = disk.reserve(60).await.unwrap();
        assert_eq!(disk.available_mib(), 40);

        let second = tokio::time::timeout(Duration::from_millis(50), disk.reserve(60)).await;
        assert!(second.is_err(), "second reservation must wait");

        drop(permit);
        let _again = disk.reserve(60).await.unwrap();
        assert_eq!(disk.available_mib(), 40);
    }
}
