//! Request orchestration.
//!
//! The [`Orchestrator`] asks a [`RequestProcessor`] which policies guard a
//! request, evaluates all of them in parallel, runs the accept or deny
//! callback while every lease is held, and then releases every lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::lease::Lease;
use crate::policy::PolicyBinding;

/// The integration layer the orchestrator drives.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// The request being admitted.
    type Request: Send + Sync;
    /// What the callbacks produce.
    type Output: Send;

    /// Policies that apply to `request`, each bound to its scope key.
    ///
    /// Either every binding is produced or the call fails; a failure
    /// leaves all bucket state untouched.
    async fn discover_policies(&self, request: &Self::Request) -> Result<Vec<PolicyBinding>>;

    /// Called when every policy granted.
    async fn on_accept(&self, request: &Self::Request) -> Result<Self::Output>;

    /// Called when at least one policy denied or failed.
    async fn on_deny(&self, request: &Self::Request) -> Result<Self::Output>;
}

/// The admission decision and the output of the callback that handled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<T> {
    Accepted(T),
    Denied(T),
}

impl<T> Verdict<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Verdict::Accepted(output) | Verdict::Denied(output) => output,
        }
    }
}

/// Leases collected for one request. Dropping the set releases any lease
/// not yet released, which covers callers that abandon `process` midway.
#[derive(Debug, Default)]
struct LeaseSet {
    leases: Vec<Lease>,
}

impl LeaseSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            leases: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, lease: Lease) {
        self.leases.push(lease);
    }

    fn len(&self) -> usize {
        self.leases.len()
    }

    fn granted(&self) -> usize {
        self.leases.iter().filter(|lease| lease.is_granted()).count()
    }

    async fn release_all(self) {
        futures::future::join_all(self.leases.iter().map(|lease| lease.release())).await;
    }
}

/// Shared state of one request's evaluations.
struct Rejection {
    rejected: AtomicBool,
    cancel: CancellationToken,
}

impl Rejection {
    fn new() -> Self {
        Self {
            rejected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Record a denial. The first one signals the shared cancellation.
    fn reject(&self) {
        if !self.rejected.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

/// Evaluates policies for requests and guarantees their leases are released.
pub struct Orchestrator<P> {
    processor: P,
    cancel_grace: Option<Duration>,
}

impl<P: RequestProcessor> Orchestrator<P> {
    /// Create an orchestrator that waits for every evaluation to finish.
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            cancel_grace: None,
        }
    }

    /// Create an orchestrator from configuration.
    pub fn from_config(processor: P, config: &OrchestratorConfig) -> Self {
        Self {
            processor,
            cancel_grace: config.cancel_grace(),
        }
    }

    /// Once a policy denies, give the remaining evaluations at most `grace`
    /// before abandoning them as failed.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = Some(grace);
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Admit or deny `request`.
    ///
    /// A request with no applicable policies is accepted. Leases are
    /// released after the callback returns, whether it succeeded or not.
    pub async fn process(&self, request: &P::Request) -> Result<Verdict<P::Output>> {
        let bindings = self.processor.discover_policies(request).await?;
        let policy_count = bindings.len();

        let rejection = Arc::new(Rejection::new());
        let leases = self.evaluate(bindings, &rejection).await;

        debug!(
            policies = policy_count,
            leases = leases.len(),
            granted = leases.granted(),
            rejected = rejection.is_rejected(),
            "Policies evaluated"
        );

        let outcome = if rejection.is_rejected() {
            self.processor.on_deny(request).await.map(Verdict::Denied)
        } else {
            self.processor.on_accept(request).await.map(Verdict::Accepted)
        };

        leases.release_all().await;
        outcome
    }

    async fn evaluate(&self, bindings: Vec<PolicyBinding>, rejection: &Arc<Rejection>) -> LeaseSet {
        let mut leases = LeaseSet::with_capacity(bindings.len());
        if bindings.is_empty() {
            return leases;
        }

        let mut tasks = JoinSet::new();
        for binding in bindings {
            let rejection = Arc::clone(rejection);
            tasks.spawn(async move {
                let result = binding.policy.obtain(&binding.scope, &rejection.cancel).await;
                match &result {
                    Ok(lease) if lease.is_granted() => {
                        trace!(
                            scope = %binding.scope,
                            kind = %binding.policy.kind(),
                            "Policy granted"
                        );
                    }
                    Ok(_) => {
                        debug!(
                            scope = %binding.scope,
                            kind = %binding.policy.kind(),
                            "Policy denied"
                        );
                        rejection.reject();
                    }
                    Err(e) => {
                        warn!(
                            scope = %binding.scope,
                            kind = %binding.policy.kind(),
                            error = %e,
                            "Policy evaluation failed, treating as denial"
                        );
                        rejection.reject();
                    }
                }
                result
            });
        }

        let mut deadline: Option<Instant> = None;
        loop {
            if deadline.is_none() && rejection.cancel.is_cancelled() {
                deadline = self.cancel_grace.map(|grace| Instant::now() + grace);
            }

            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(
                                pending = tasks.len(),
                                "Abandoning policy evaluations after denial"
                            );
                            tasks.abort_all();
                            while let Some(joined) = tasks.join_next().await {
                                if let Ok(Ok(lease)) = joined {
                                    leases.push(lease);
                                }
                            }
                            break;
                        }
                    }
                }
                None if self.cancel_grace.is_some() => {
                    tokio::select! {
                        joined = tasks.join_next() => joined,
                        _ = rejection.cancel.cancelled() => continue,
                    }
                }
                None => tasks.join_next().await,
            };

            match joined {
                None => break,
                Some(Ok(Ok(lease))) => leases.push(lease),
                // Already logged and counted as a denial by the task.
                Some(Ok(Err(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Policy evaluation panicked, treating as denial");
                    rejection.reject();
                }
            }
        }

        leases
    }
}
