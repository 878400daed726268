//! Sliding window policy.
//!
//! Every grant enqueues the instant at which it stops counting against the
//! key (`grant time + period`). A key admits a new request while fewer than
//! `quantity` of those instants lie in the future.
//!
//! [`Precision::Strict`] evicts and counts under the entry lock, so each
//! decision sees the exact live set. [`Precision::Performance`] keeps an
//! atomic live count that a per-key background evictor decrements as
//! entries expire; callers read that count without waiting for the evictor
//! and may act on a slightly stale value.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Policy, PolicyKind, Precision, ScopeKey, WindowConfig};
use crate::error::Result;
use crate::lease::Lease;

type WindowKey = (ScopeKey, WindowConfig);

/// Performance-mode state for one key.
#[derive(Debug, Default)]
struct SlidingBucket {
    /// Grants whose expiry has not been evicted yet
    live: AtomicU64,
    /// Expiry instants, oldest first
    expiries: Mutex<VecDeque<Instant>>,
    /// Whether an evictor task currently owns this bucket
    evicting: AtomicBool,
}

enum SlidingWindowState {
    Strict(DashMap<WindowKey, VecDeque<Instant>>),
    Performance(DashMap<WindowKey, Arc<SlidingBucket>>),
}

/// Sliding window buckets shared by every [`SlidingWindowPolicy`] of a store.
pub(super) struct SlidingWindowBuckets {
    state: SlidingWindowState,
    shutdown: CancellationToken,
}

impl SlidingWindowBuckets {
    pub(super) fn new(precision: Precision, shutdown: CancellationToken) -> Self {
        let state = match precision {
            Precision::Strict => SlidingWindowState::Strict(DashMap::new()),
            Precision::Performance => SlidingWindowState::Performance(DashMap::new()),
        };
        Self { state, shutdown }
    }

    fn evaluate(self: &Arc<Self>, scope: &ScopeKey, config: WindowConfig) -> bool {
        let key = (scope.clone(), config);
        match &self.state {
            SlidingWindowState::Strict(map) => self.evaluate_strict(map, key),
            SlidingWindowState::Performance(map) => self.evaluate_performance(map, key),
        }
    }

    fn evaluate_strict(
        self: &Arc<Self>,
        map: &DashMap<WindowKey, VecDeque<Instant>>,
        key: WindowKey,
    ) -> bool {
        let config = key.1;
        let now = Instant::now();
        let mut created = false;

        let granted = {
            let mut queue = map.entry(key.clone()).or_insert_with(|| {
                created = true;
                VecDeque::new()
            });

            while queue.front().is_some_and(|expiry| *expiry <= now) {
                queue.pop_front();
            }

            let granted = (queue.len() as u64) < config.quantity();
            if granted {
                queue.push_back(now + config.period());
            }
            granted
        };

        if created {
            debug!(scope = %key.0, quantity = config.quantity(), "Creating sliding window bucket");
            self.schedule_strict_reclaim(key);
        }

        granted
    }

    fn evaluate_performance(
        self: &Arc<Self>,
        map: &DashMap<WindowKey, Arc<SlidingBucket>>,
        key: WindowKey,
    ) -> bool {
        let config = key.1;
        let existing = map.get(&key).map(|bucket| Arc::clone(bucket.value()));
        let bucket = match existing {
            Some(bucket) => bucket,
            None => map
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SlidingBucket::default()))
                .value()
                .clone(),
        };

        if bucket.live.load(Ordering::Acquire) >= config.quantity() {
            return false;
        }

        bucket.live.fetch_add(1, Ordering::AcqRel);
        bucket
            .expiries
            .lock()
            .push_back(Instant::now() + config.period());

        if !bucket.evicting.swap(true, Ordering::AcqRel) {
            self.spawn_evictor(key, bucket);
        }

        true
    }

    /// Wait for the newest entry of a strict bucket to expire, then drop the
    /// bucket if nothing newer arrived in the meantime.
    fn schedule_strict_reclaim(self: &Arc<Self>, key: WindowKey) {
        let buckets = Arc::clone(self);
        tokio::spawn(async move {
            let SlidingWindowState::Strict(map) = &buckets.state else {
                return;
            };

            loop {
                let deadline = match map.get(&key) {
                    Some(queue) => queue.back().copied().unwrap_or_else(Instant::now),
                    None => return,
                };

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = buckets.shutdown.cancelled() => return,
                }

                let now = Instant::now();
                let removed = map
                    .remove_if(&key, |_, queue| queue.back().map_or(true, |expiry| *expiry <= now))
                    .is_some();
                if removed {
                    debug!(scope = %key.0, "Reclaimed idle sliding window bucket");
                    return;
                }
            }
        });
    }

    /// Evict expired entries of a performance bucket as they come due. The
    /// task ends once the queue drains, removing the bucket on its way out.
    fn spawn_evictor(self: &Arc<Self>, key: WindowKey, bucket: Arc<SlidingBucket>) {
        let buckets = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next_expiry = {
                    let mut queue = bucket.expiries.lock();
                    let now = Instant::now();
                    let mut evicted = 0;
                    while queue.front().is_some_and(|expiry| *expiry <= now) {
                        queue.pop_front();
                        evicted += 1;
                    }
                    if evicted > 0 {
                        bucket.live.fetch_sub(evicted, Ordering::AcqRel);
                        trace!(scope = %key.0, evicted, "Evicted sliding window entries");
                    }

                    match queue.front() {
                        Some(expiry) => *expiry,
                        None => {
                            // Cleared under the queue lock so a concurrent
                            // push either sees it and spawns a new evictor,
                            // or lands before and keeps this one running.
                            bucket.evicting.store(false, Ordering::Release);
                            break;
                        }
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep_until(next_expiry) => {}
                    _ = buckets.shutdown.cancelled() => return,
                }
            }

            if let SlidingWindowState::Performance(map) = &buckets.state {
                let removed = map
                    .remove_if(&key, |_, current| {
                        Arc::ptr_eq(current, &bucket)
                            && current.live.load(Ordering::Acquire) == 0
                            && !current.evicting.load(Ordering::Acquire)
                    })
                    .is_some();
                if removed {
                    debug!(scope = %key.0, "Reclaimed drained sliding window bucket");
                }
            }
        });
    }

    /// Grants still counting against the key's window.
    pub(super) fn live_count(&self, scope: &ScopeKey, config: WindowConfig) -> Option<u64> {
        let key = (scope.clone(), config);
        match &self.state {
            SlidingWindowState::Strict(map) => {
                let now = Instant::now();
                map.get(&key)
                    .map(|queue| queue.iter().filter(|expiry| **expiry > now).count() as u64)
            }
            SlidingWindowState::Performance(map) => {
                map.get(&key).map(|bucket| bucket.live.load(Ordering::Acquire))
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        match &self.state {
            SlidingWindowState::Strict(map) => map.len(),
            SlidingWindowState::Performance(map) => map.len(),
        }
    }

    pub(super) fn clear(&self) {
        match &self.state {
            SlidingWindowState::Strict(map) => map.clear(),
            SlidingWindowState::Performance(map) => map.clear(),
        }
    }
}

/// Grants at most `quantity` evaluations per scope key within any trailing
/// interval of `period`. Leases carry no release action.
#[derive(Clone)]
pub struct SlidingWindowPolicy {
    config: WindowConfig,
    buckets: Arc<SlidingWindowBuckets>,
}

impl SlidingWindowPolicy {
    pub(super) fn new(config: WindowConfig, buckets: Arc<SlidingWindowBuckets>) -> Self {
        Self { config, buckets }
    }

    /// The window this policy enforces.
    pub fn config(&self) -> WindowConfig {
        self.config
    }
}

impl fmt::Debug for SlidingWindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowPolicy")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Policy for SlidingWindowPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::SlidingWindow
    }

    async fn obtain(&self, scope: &ScopeKey, _cancel: &CancellationToken) -> Result<Lease> {
        let granted = self.buckets.evaluate(scope, self.config);
        trace!(scope = %scope, granted, "Evaluated sliding window");
        Ok(Lease::new(granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(precision: Precision, period_ms: u64, quantity: u64) -> SlidingWindowPolicy {
        let buckets = Arc::new(SlidingWindowBuckets::new(precision, CancellationToken::new()));
        let config = WindowConfig::new(Duration::from_millis(period_ms), quantity).unwrap();
        SlidingWindowPolicy::new(config, buckets)
    }

    async fn grants(policy: &SlidingWindowPolicy, scope: &ScopeKey) -> bool {
        policy
            .obtain(scope, &CancellationToken::new())
            .await
            .unwrap()
            .is_granted()
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_window_slides() {
        let policy = policy(Precision::Strict, 100, 3);
        let scope = ScopeKey::from("k");

        assert!(grants(&policy, &scope).await);
        assert!(grants(&policy, &scope).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(grants(&policy, &scope).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!grants(&policy, &scope).await);

        // The two grants from t=0 expire at t=100; the one from t=50 does not.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(grants(&policy, &scope).await);
        assert!(grants(&policy, &scope).await);
        assert!(!grants(&policy, &scope).await);
        assert_eq!(policy.buckets.live_count(&scope, policy.config), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_requests_do_not_extend_window() {
        let policy = policy(Precision::Strict, 100, 1);
        let scope = ScopeKey::from("k");

        assert!(grants(&policy, &scope).await);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!grants(&policy, &scope).await);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(grants(&policy, &scope).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_performance_evictor_frees_capacity() {
        let policy = policy(Precision::Performance, 100, 3);
        let scope = ScopeKey::from("k");

        for _ in 0..3 {
            assert!(grants(&policy, &scope).await);
        }
        assert!(!grants(&policy, &scope).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert!(grants(&policy, &scope).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_performance_bucket_removed_when_drained() {
        let policy = policy(Precision::Performance, 100, 3);
        let scope = ScopeKey::from("k");

        assert!(grants(&policy, &scope).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(grants(&policy, &scope).await);
        assert_eq!(policy.buckets.live_count(&scope, policy.config), Some(2));

        tokio::time::sleep(Duration::from_millis(70)).await;
        settle().await;
        assert_eq!(policy.buckets.live_count(&scope, policy.config), Some(1));
        assert_eq!(policy.buckets.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        settle().await;
        assert_eq!(policy.buckets.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_bucket_reclaimed_after_last_expiry() {
        let policy = policy(Precision::Strict, 100, 3);
        let scope = ScopeKey::from("k");

        assert!(grants(&policy, &scope).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(grants(&policy, &scope).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(policy.buckets.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(policy.buckets.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_keys_are_independent() {
        for precision in [Precision::Strict, Precision::Performance] {
            let policy = policy(precision, 1000, 1);
            let a = ScopeKey::from("a");
            let b = ScopeKey::from("b");

            assert!(grants(&policy, &a).await);
            assert!(!grants(&policy, &a).await);
            assert!(grants(&policy, &b).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_quantity_denies() {
        for precision in [Precision::Strict, Precision::Performance] {
            let policy = policy(precision, 100, 0);
            assert!(!grants(&policy, &ScopeKey::from("k")).await);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_strict_parallel_grants_exactly_quantity() {
        for _ in 0..20 {
            let policy = policy(Precision::Strict, 60_000, 7);
            let scope = ScopeKey::from("contended");

            let handles: Vec<_> = (0..64)
                .map(|_| {
                    let policy = policy.clone();
                    let scope = scope.clone();
                    tokio::spawn(async move { grants(&policy, &scope).await })
                })
                .collect();

            let mut granted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    granted += 1;
                }
            }

            assert_eq!(granted, 7);
            assert_eq!(policy.buckets.live_count(&scope, policy.config), Some(7));
            policy.buckets.shutdown.cancel();
        }
    }
}
