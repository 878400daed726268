//! In-memory bucket state shared by policies.

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::concurrent::ConcurrentBuckets;
use super::fixed::FixedWindowBuckets;
use super::sliding::SlidingWindowBuckets;
use super::{
    ConcurrencyConfig, ConcurrentWindowPolicy, FixedWindowPolicy, Policy, PolicySpec, ScopeKey,
    SlidingWindowPolicy, WindowConfig,
};

/// How window buckets trade accuracy for contention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum Precision {
    /// Every decision for a key is made under that key's lock.
    #[default]
    Strict,
    /// Lock-light counters with timer-driven reclamation; decisions near a
    /// window boundary may be approximate.
    Performance,
}

/// The bucket maps behind every policy handed out by this store.
///
/// Policies created from the same store share state: two policies with the
/// same kind and configuration evaluated against the same scope key draw on
/// the same bucket. Use separate stores for rate limiters whose keys must
/// not collide.
///
/// Background reclamation tasks stop when the store is dropped or
/// [`BucketStore::shutdown`] is called. Window reclamation needs a running
/// tokio runtime.
pub struct BucketStore {
    precision: Precision,
    fixed: Arc<FixedWindowBuckets>,
    sliding: Arc<SlidingWindowBuckets>,
    concurrent: Arc<ConcurrentBuckets>,
    shutdown: CancellationToken,
}

impl BucketStore {
    /// Create an empty store whose window buckets use `precision`.
    pub fn new(precision: Precision) -> Self {
        let shutdown = CancellationToken::new();
        info!(precision = ?precision, "Bucket store initialized");
        Self {
            precision,
            fixed: Arc::new(FixedWindowBuckets::new(precision, shutdown.clone())),
            sliding: Arc::new(SlidingWindowBuckets::new(precision, shutdown.clone())),
            concurrent: Arc::new(ConcurrentBuckets::new()),
            shutdown,
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Build the policy described by `spec`.
    pub fn policy(&self, spec: &PolicySpec) -> Arc<dyn Policy> {
        debug!(kind = %spec.kind(), "Creating policy");
        match *spec {
            PolicySpec::FixedWindow(config) => Arc::new(self.fixed_window(config)),
            PolicySpec::SlidingWindow(config) => Arc::new(self.sliding_window(config)),
            PolicySpec::ConcurrentWindow(config) => Arc::new(self.concurrent_window(config)),
        }
    }

    pub fn fixed_window(&self, config: WindowConfig) -> FixedWindowPolicy {
        FixedWindowPolicy::new(config, Arc::clone(&self.fixed))
    }

    pub fn sliding_window(&self, config: WindowConfig) -> SlidingWindowPolicy {
        SlidingWindowPolicy::new(config, Arc::clone(&self.sliding))
    }

    pub fn concurrent_window(&self, config: ConcurrencyConfig) -> ConcurrentWindowPolicy {
        ConcurrentWindowPolicy::new(config, Arc::clone(&self.concurrent))
    }

    /// Evaluations counted in a fixed window's current period.
    pub fn fixed_window_count(&self, scope: &ScopeKey, config: WindowConfig) -> Option<u64> {
        self.fixed.current_count(scope, config)
    }

    /// Grants still live in a sliding window.
    pub fn sliding_window_live(&self, scope: &ScopeKey, config: WindowConfig) -> Option<u64> {
        self.sliding.live_count(scope, config)
    }

    /// Leases currently outstanding against a concurrent window.
    pub fn concurrent_outstanding(&self, scope: &ScopeKey, config: ConcurrencyConfig) -> u64 {
        self.concurrent.outstanding(scope, config)
    }

    /// Drop fixed window buckets whose period has elapsed. Returns how many
    /// were removed. Only strict buckets are swept.
    pub fn purge_expired(&self) -> usize {
        let purged = self.fixed.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired fixed window buckets");
        }
        purged
    }

    /// Total number of live buckets across all kinds.
    pub fn bucket_count(&self) -> usize {
        self.fixed_bucket_count() + self.sliding_bucket_count() + self.concurrent_bucket_count()
    }

    pub fn fixed_bucket_count(&self) -> usize {
        self.fixed.len()
    }

    pub fn sliding_bucket_count(&self) -> usize {
        self.sliding.len()
    }

    pub fn concurrent_bucket_count(&self) -> usize {
        self.concurrent.len()
    }

    /// Clear all buckets.
    ///
    /// Outstanding concurrent leases released afterwards are ignored.
    pub fn clear(&self) {
        self.fixed.clear();
        self.sliding.clear();
        self.concurrent.clear();
    }

    /// Stop all background reclamation tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new(Precision::default())
    }
}

impl Drop for BucketStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStore")
            .field("precision", &self.precision)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyKind;
    use std::time::Duration;

    fn window(period_ms: u64, quantity: u64) -> WindowConfig {
        WindowConfig::new(Duration::from_millis(period_ms), quantity).unwrap()
    }

    #[tokio::test]
    async fn test_store_creation() {
        let store = BucketStore::default();
        assert_eq!(store.precision(), Precision::Strict);
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_policy_dispatch_by_spec() {
        let store = BucketStore::new(Precision::Performance);

        let specs = [
            PolicySpec::FixedWindow(window(1000, 1)),
            PolicySpec::SlidingWindow(window(1000, 1)),
            PolicySpec::ConcurrentWindow(ConcurrencyConfig::new(1)),
        ];

        for spec in specs {
            let policy = store.policy(&spec);
            assert_eq!(policy.kind(), spec.kind());
        }
        assert_eq!(store.policy(&specs[2]).kind(), PolicyKind::ConcurrentWindow);
    }

    #[tokio::test]
    async fn test_policies_from_one_store_share_state() {
        let store = BucketStore::default();
        let config = window(60_000, 2);
        let first = store.fixed_window(config);
        let second = store.fixed_window(config);
        let scope = ScopeKey::from("shared");
        let cancel = CancellationToken::new();

        assert!(first.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert!(second.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert!(!first.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert_eq!(store.fixed_window_count(&scope, config), Some(3));
    }

    #[tokio::test]
    async fn test_separate_stores_do_not_share_state() {
        let config = window(60_000, 1);
        let scope = ScopeKey::from("k");
        let cancel = CancellationToken::new();

        let store_a = BucketStore::default();
        let store_b = BucketStore::default();

        assert!(store_a.sliding_window(config).obtain(&scope, &cancel).await.unwrap().is_granted());
        assert!(store_b.sliding_window(config).obtain(&scope, &cancel).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_bucket_counts_and_clear() {
        let store = BucketStore::default();
        let scope = ScopeKey::from("k");
        let cancel = CancellationToken::new();

        store.fixed_window(window(60_000, 5)).obtain(&scope, &cancel).await.unwrap();
        store.sliding_window(window(60_000, 5)).obtain(&scope, &cancel).await.unwrap();
        let lease = store
            .concurrent_window(ConcurrencyConfig::new(5))
            .obtain(&scope, &cancel)
            .await
            .unwrap();

        assert_eq!(store.fixed_bucket_count(), 1);
        assert_eq!(store.sliding_bucket_count(), 1);
        assert_eq!(store.concurrent_bucket_count(), 1);
        assert_eq!(store.concurrent_outstanding(&scope, ConcurrencyConfig::new(5)), 1);

        store.clear();
        assert_eq!(store.bucket_count(), 0);

        // Releasing after a clear must not resurrect or underflow the bucket.
        lease.release().await;
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_different_configs_use_different_buckets() {
        let store = BucketStore::default();
        let scope = ScopeKey::from("k");
        let cancel = CancellationToken::new();

        let strict = store.fixed_window(window(60_000, 1));
        let loose = store.fixed_window(window(60_000, 5));

        assert!(strict.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert!(!strict.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert!(loose.obtain(&scope, &cancel).await.unwrap().is_granted());
        assert_eq!(store.fixed_bucket_count(), 2);
    }
}
