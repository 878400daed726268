//! Admission policies and the bucket state behind them.
//!
//! A [`Policy`] turns a [`ScopeKey`] into a [`Lease`]. The configuration a
//! policy carries is immutable; all mutable state lives in the
//! [`BucketStore`] the policy was created from, so many policy instances can
//! share one key space.

mod concurrent;
mod fixed;
mod rules;
mod scope;
mod sliding;
mod store;

pub use concurrent::ConcurrentWindowPolicy;
pub use fixed::FixedWindowPolicy;
pub use rules::{PolicyRegistry, PolicyRule, RequestShape, RouteConfig, RulesConfig, ScopePart};
pub use scope::{ScopeKey, ScopeKeyBuilder};
pub use sliding::SlidingWindowPolicy;
pub use store::{BucketStore, Precision};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TurnstileError};
use crate::lease::Lease;

/// A rule that decides whether a request may proceed.
#[async_trait]
pub trait Policy: Send + Sync + fmt::Debug {
    /// The kind of window this policy enforces.
    fn kind(&self) -> PolicyKind;

    /// Evaluate the policy for `scope` and return the resulting lease.
    ///
    /// `cancel` is advisory: it fires once another policy for the same
    /// request has denied. Implementations may ignore it.
    async fn obtain(&self, scope: &ScopeKey, cancel: &CancellationToken) -> Result<Lease>;
}

/// A policy bound to the scope key it should be evaluated against.
#[derive(Debug, Clone)]
pub struct PolicyBinding {
    /// Bucket the request falls into for this policy
    pub scope: ScopeKey,
    /// The policy to evaluate
    pub policy: Arc<dyn Policy>,
}

impl PolicyBinding {
    /// Bind a policy to a scope key.
    pub fn new(scope: impl Into<ScopeKey>, policy: Arc<dyn Policy>) -> Self {
        Self {
            scope: scope.into(),
            policy,
        }
    }
}

/// The three supported window kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    FixedWindow,
    SlidingWindow,
    ConcurrentWindow,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::FixedWindow => "fixed_window",
            PolicyKind::SlidingWindow => "sliding_window",
            PolicyKind::ConcurrentWindow => "concurrent_window",
        };
        f.write_str(name)
    }
}

/// Parameters for fixed and sliding window policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WindowConfigRepr", into = "WindowConfigRepr")]
pub struct WindowConfig {
    period: Duration,
    quantity: u64,
}

impl WindowConfig {
    /// Allow `quantity` grants per `period`. The period must be a whole,
    /// non-zero number of milliseconds.
    pub fn new(period: Duration, quantity: u64) -> Result<Self> {
        if period.is_zero() {
            return Err(TurnstileError::InvalidPolicy(
                "window period must be greater than zero".to_string(),
            ));
        }
        if period.subsec_nanos() % 1_000_000 != 0 || u64::try_from(period.as_millis()).is_err() {
            return Err(TurnstileError::InvalidPolicy(format!(
                "window period {:?} is not a whole number of milliseconds",
                period
            )));
        }
        Ok(Self { period, quantity })
    }

    /// Length of the window.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Maximum grants per window.
    pub fn quantity(&self) -> u64 {
        self.quantity
    }
}

/// On-disk form of [`WindowConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowConfigRepr {
    period_ms: u64,
    quantity: u64,
}

impl TryFrom<WindowConfigRepr> for WindowConfig {
    type Error = TurnstileError;

    fn try_from(repr: WindowConfigRepr) -> Result<Self> {
        WindowConfig::new(Duration::from_millis(repr.period_ms), repr.quantity)
    }
}

impl From<WindowConfig> for WindowConfigRepr {
    fn from(config: WindowConfig) -> Self {
        Self {
            period_ms: u64::try_from(config.period.as_millis()).unwrap_or(u64::MAX),
            quantity: config.quantity,
        }
    }
}

/// Parameters for concurrent window policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum simultaneous holds per scope key
    pub degree: u64,
}

impl ConcurrencyConfig {
    pub fn new(degree: u64) -> Self {
        Self { degree }
    }
}

/// A policy kind together with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySpec {
    FixedWindow(WindowConfig),
    SlidingWindow(WindowConfig),
    ConcurrentWindow(ConcurrencyConfig),
}

impl PolicySpec {
    /// The kind this spec configures.
    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicySpec::FixedWindow(_) => PolicyKind::FixedWindow,
            PolicySpec::SlidingWindow(_) => PolicyKind::SlidingWindow,
            PolicySpec::ConcurrentWindow(_) => PolicyKind::ConcurrentWindow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_period_rejected() {
        let result = WindowConfig::new(Duration::ZERO, 10);
        assert!(matches!(result, Err(TurnstileError::InvalidPolicy(_))));
    }

    #[test]
    fn test_sub_millisecond_period_rejected() {
        for period in [Duration::from_micros(500), Duration::from_micros(1500)] {
            let result = WindowConfig::new(period, 10);
            assert!(matches!(result, Err(TurnstileError::InvalidPolicy(_))));
        }
    }

    #[test]
    fn test_window_config_yaml_keeps_period() {
        let config = WindowConfig::new(Duration::from_millis(1), 3).unwrap();
        let spec = PolicySpec::SlidingWindow(config);
        let yaml = serde_yaml::to_string(&spec).unwrap();
        assert!(yaml.contains("period_ms: 1"));
        assert_eq!(serde_yaml::from_str::<PolicySpec>(&yaml).unwrap(), spec);
    }

    #[test]
    fn test_parse_policy_specs() {
        let yaml = r#"
- kind: fixed_window
  period_ms: 1000
  quantity: 10
- kind: sliding_window
  period_ms: 250
  quantity: 3
- kind: concurrent_window
  degree: 4
"#;
        let specs: Vec<PolicySpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs[0],
            PolicySpec::FixedWindow(WindowConfig::new(Duration::from_secs(1), 10).unwrap())
        );
        assert_eq!(specs[1].kind(), PolicyKind::SlidingWindow);
        assert_eq!(specs[2], PolicySpec::ConcurrentWindow(ConcurrencyConfig::new(4)));
    }

    #[test]
    fn test_parse_zero_period_fails() {
        let yaml = "kind: fixed_window\nperiod_ms: 0\nquantity: 1\n";
        assert!(serde_yaml::from_str::<PolicySpec>(yaml).is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(PolicyKind::ConcurrentWindow.to_string(), "concurrent_window");
    }
}
