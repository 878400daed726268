//! Leases returned by policies.
//!
//! A [`Lease`] carries the verdict of a single policy evaluation together
//! with the action that hands the borrowed allocation back to its bucket.
//! The action runs at most once, no matter how many times [`Lease::release`]
//! is called or whether the lease is simply dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

/// Action that returns an allocation to its bucket.
enum ReleaseAction {
    Sync(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
}

/// A grant or deny verdict plus an exactly-once release obligation.
pub struct Lease {
    granted: bool,
    action: Mutex<Option<ReleaseAction>>,
    released: AtomicBool,
}

impl Lease {
    /// A lease with nothing to give back.
    pub fn new(granted: bool) -> Self {
        Self {
            granted,
            action: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// A granted lease without a release action.
    pub fn granted() -> Self {
        Self::new(true)
    }

    /// A denied lease without a release action.
    pub fn denied() -> Self {
        Self::new(false)
    }

    /// A lease whose release runs `action` synchronously.
    pub fn with_release<F>(granted: bool, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            granted,
            action: Mutex::new(Some(ReleaseAction::Sync(Box::new(action)))),
            released: AtomicBool::new(false),
        }
    }

    /// A lease whose release awaits the future produced by `action`.
    pub fn with_async_release<F>(granted: bool, action: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            granted,
            action: Mutex::new(Some(ReleaseAction::Async(Box::new(action)))),
            released: AtomicBool::new(false),
        }
    }

    /// Whether the policy admitted the request.
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// Whether `release` has already run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Give the allocation back. Only the first call has an effect.
    pub async fn release(&self) {
        let action = self.take_action();
        match action {
            Some(ReleaseAction::Sync(f)) => f(),
            Some(ReleaseAction::Async(f)) => f().await,
            None => {}
        }
    }

    fn take_action(&self) -> Option<ReleaseAction> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.action.lock().take()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.take_action() {
            Some(ReleaseAction::Sync(f)) => {
                trace!(granted = self.granted, "Releasing lease on drop");
                f();
            }
            Some(ReleaseAction::Async(f)) => {
                // Outside a runtime the future cannot be driven; the bucket
                // keeps the allocation until it is reclaimed.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    trace!(granted = self.granted, "Spawning async lease release on drop");
                    handle.spawn(f());
                }
            }
            None => {}
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("granted", &self.granted)
            .field("released", &self.is_released())
            .finish()
    }
}
