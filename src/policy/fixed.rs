//! Fixed window policy.
//!
//! Each scope key owns a counter that resets once its window has elapsed.
//! In [`Precision::Strict`] the reset, the check and the increment for a key
//! happen under the map's entry lock. In [`Precision::Performance`] the
//! counter is a bare atomic and the whole bucket is dropped by a timer that
//! is armed exactly once, when the bucket is created. A stale timer can
//! therefore clear a bucket early or late around a window boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Policy, PolicyKind, Precision, ScopeKey, WindowConfig};
use crate::error::Result;
use crate::lease::Lease;

type WindowKey = (ScopeKey, WindowConfig);

/// Strict-mode state for one key.
#[derive(Debug)]
struct FixedBucket {
    /// Evaluations since the window started, including denied ones
    count: u64,
    /// Instant at which the current window ends
    expires_at: Instant,
}

enum FixedWindowState {
    Strict(DashMap<WindowKey, FixedBucket>),
    Performance(DashMap<WindowKey, Arc<AtomicU64>>),
}

/// Fixed window buckets shared by every [`FixedWindowPolicy`] of a store.
pub(super) struct FixedWindowBuckets {
    state: FixedWindowState,
    shutdown: CancellationToken,
}

impl FixedWindowBuckets {
    pub(super) fn new(precision: Precision, shutdown: CancellationToken) -> Self {
        let state = match precision {
            Precision::Strict => FixedWindowState::Strict(DashMap::new()),
            Precision::Performance => FixedWindowState::Performance(DashMap::new()),
        };
        Self { state, shutdown }
    }

    /// Count one evaluation against the key's window and report whether it
    /// fits within the quantity.
    fn evaluate(self: &Arc<Self>, scope: &ScopeKey, config: WindowConfig) -> bool {
        let key = (scope.clone(), config);
        match &self.state {
            FixedWindowState::Strict(map) => self.evaluate_strict(map, key),
            FixedWindowState::Performance(map) => self.evaluate_performance(map, key),
        }
    }

    fn evaluate_strict(
        self: &Arc<Self>,
        map: &DashMap<WindowKey, FixedBucket>,
        key: WindowKey,
    ) -> bool {
        let config = key.1;
        let now = Instant::now();

        let (granted, window_started) = {
            let mut bucket = map.entry(key.clone()).or_insert_with(|| FixedBucket {
                count: 0,
                expires_at: now,
            });

            let mut window_started = None;
            if now >= bucket.expires_at {
                bucket.count = 0;
                bucket.expires_at = now + config.period();
                window_started = Some(bucket.expires_at);
            }

            let granted = bucket.count < config.quantity();
            bucket.count = bucket.count.saturating_add(1);
            (granted, window_started)
        };

        if let Some(expires_at) = window_started {
            trace!(scope = %key.0, "Fixed window started");
            self.schedule_strict_reclaim(key, expires_at);
        }

        granted
    }

    fn evaluate_performance(
        self: &Arc<Self>,
        map: &DashMap<WindowKey, Arc<AtomicU64>>,
        key: WindowKey,
    ) -> bool {
        let config = key.1;
        let mut created = false;
        // Shared read lock on the hot path; the entry write lock only on a miss.
        let existing = map.get(&key).map(|counter| Arc::clone(counter.value()));
        let counter = match existing {
            Some(counter) => counter,
            None => map
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(AtomicU64::new(0))
                })
                .value()
                .clone(),
        };

        if created {
            debug!(scope = %key.0, quantity = config.quantity(), "Creating fixed window bucket");
            self.schedule_performance_reclaim(key);
        }

        let previous = counter.fetch_add(1, Ordering::AcqRel);
        previous < config.quantity()
    }

    /// Drop the bucket once its window has elapsed. The expiry is checked
    /// again under the entry lock, so a window restarted in the meantime
    /// survives.
    fn schedule_strict_reclaim(self: &Arc<Self>, key: WindowKey, expires_at: Instant) {
        let buckets = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expires_at) => {}
                _ = buckets.shutdown.cancelled() => return,
            }

            if let FixedWindowState::Strict(map) = &buckets.state {
                let removed = map
                    .remove_if(&key, |_, bucket| Instant::now() >= bucket.expires_at)
                    .is_some();
                if removed {
                    debug!(scope = %key.0, "Reclaimed expired fixed window bucket");
                }
            }
        });
    }

    /// Drop the bucket one period after creation, unconditionally.
    fn schedule_performance_reclaim(self: &Arc<Self>, key: WindowKey) {
        let buckets = Arc::clone(self);
        let deadline = Instant::now() + key.1.period();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = buckets.shutdown.cancelled() => return,
            }

            if let FixedWindowState::Performance(map) = &buckets.state {
                if map.remove(&key).is_some() {
                    debug!(scope = %key.0, "Reclaimed fixed window bucket");
                }
            }
        });
    }

    /// Evaluations counted in the key's current window, if a bucket exists.
    pub(super) fn current_count(&self, scope: &ScopeKey, config: WindowConfig) -> Option<u64> {
        let key = (scope.clone(), config);
        match &self.state {
            FixedWindowState::Strict(map) => map.get(&key).map(|b| b.count),
            FixedWindowState::Performance(map) => map.get(&key).map(|c| c.load(Ordering::Acquire)),
        }
    }

    /// Remove every strict bucket whose window has elapsed.
    pub(super) fn purge_expired(&self) -> usize {
        match &self.state {
            FixedWindowState::Strict(map) => {
                let before = map.len();
                let now = Instant::now();
                map.retain(|_, bucket| now < bucket.expires_at);
                before.saturating_sub(map.len())
            }
            // Performance buckets are only ever removed by their timer.
            FixedWindowState::Performance(_) => 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        match &self.state {
            FixedWindowState::Strict(map) => map.len(),
            FixedWindowState::Performance(map) => map.len(),
        }
    }

    pub(super) fn clear(&self) {
        match &self.state {
            FixedWindowState::Strict(map) => map.clear(),
            FixedWindowState::Performance(map) => map.clear(),
        }
    }
}

/// Grants at most `quantity` evaluations per scope key in each window of
/// `period`. Leases carry no release action.
#[derive(Clone)]
pub struct FixedWindowPolicy {
    config: WindowConfig,
    buckets: Arc<FixedWindowBuckets>,
}

impl FixedWindowPolicy {
    pub(super) fn new(config: WindowConfig, buckets: Arc<FixedWindowBuckets>) -> Self {
        Self { config, buckets }
    }

    /// The window this policy enforces.
    pub fn config(&self) -> WindowConfig {
        self.config
    }
}

impl fmt::Debug for FixedWindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindowPolicy")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Policy for FixedWindowPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::FixedWindow
    }

    async fn obtain(&self, scope: &ScopeKey, _cancel: &CancellationToken) -> Result<Lease> {
        let granted = self.buckets.evaluate(scope, self.config);
        trace!(scope = %scope, granted, "Evaluated fixed window");
        Ok(Lease::new(granted))
    }
}
