//! Turnstile - In-process Admission Control
//!
//! This crate decides whether a request may proceed based on the rate
//! limiting policies that apply to it. Policies hand out leases against
//! shared in-memory buckets; the orchestrator evaluates every policy for a
//! request in parallel and guarantees each lease is released once the
//! request has been handled.

pub mod config;
pub mod error;
pub mod lease;
pub mod orchestrator;
pub mod policy;

pub use error::{Result, TurnstileError};
pub use lease::Lease;
pub use orchestrator::{Orchestrator, RequestProcessor, Verdict};
pub use policy::{BucketStore, Policy, PolicyBinding, PolicyKind, PolicySpec, Precision, ScopeKey};
