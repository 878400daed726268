//! Concurrent window policy.
//!
//! Counts outstanding leases per scope key. Every evaluation takes a slot,
//! granted or not, and gives it back when its lease is released, so a slow
//! release of a denied request still holds capacity until then. The bucket
//! is removed as soon as its count returns to zero. There is no
//! performance variant; updates always happen under the entry lock.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ConcurrencyConfig, Policy, PolicyKind, ScopeKey};
use crate::error::Result;
use crate::lease::Lease;

type ConcurrencyKey = (ScopeKey, ConcurrencyConfig);

/// Outstanding-lease counters shared by every [`ConcurrentWindowPolicy`] of
/// a store.
#[derive(Debug, Default)]
pub(super) struct ConcurrentBuckets {
    outstanding: DashMap<ConcurrencyKey, u64>,
}

impl ConcurrentBuckets {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Take a slot and report the count including it.
    fn acquire(&self, key: &ConcurrencyKey) -> u64 {
        let mut count = self.outstanding.entry(key.clone()).or_insert_with(|| {
            debug!(scope = %key.0, degree = key.1.degree, "Creating concurrent window bucket");
            0
        });
        *count += 1;
        *count
    }

    /// Give a slot back, dropping the bucket once nothing is outstanding.
    fn release(&self, key: &ConcurrencyKey) {
        if let Entry::Occupied(mut entry) = self.outstanding.entry(key.clone()) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
                debug!(scope = %key.0, "Reclaimed idle concurrent window bucket");
            }
        }
    }

    /// Slots currently held for a key.
    pub(super) fn outstanding(&self, scope: &ScopeKey, config: ConcurrencyConfig) -> u64 {
        self.outstanding
            .get(&(scope.clone(), config))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub(super) fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub(super) fn clear(&self) {
        self.outstanding.clear();
    }
}

/// Grants while at most `degree` leases are outstanding for a scope key.
#[derive(Clone)]
pub struct ConcurrentWindowPolicy {
    config: ConcurrencyConfig,
    buckets: Arc<ConcurrentBuckets>,
}

impl ConcurrentWindowPolicy {
    pub(super) fn new(config: ConcurrencyConfig, buckets: Arc<ConcurrentBuckets>) -> Self {
        Self { config, buckets }
    }

    pub fn config(&self) -> ConcurrencyConfig {
        self.config
    }
}

impl fmt::Debug for ConcurrentWindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentWindowPolicy")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Policy for ConcurrentWindowPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ConcurrentWindow
    }

    async fn obtain(&self, scope: &ScopeKey, _cancel: &CancellationToken) -> Result<Lease> {
        let key = (scope.clone(), self.config);
        let outstanding = self.buckets.acquire(&key);
        let granted = outstanding <= self.config.degree;
        trace!(scope = %scope, outstanding, granted, "Evaluated concurrent window");

        let buckets = Arc::clone(&self.buckets);
        Ok(Lease::with_release(granted, move || buckets.release(&key)))
    }
}
