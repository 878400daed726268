use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{debug, info, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use turnstile::config::TurnstileConfig;
use turnstile::policy::{PolicyRegistry, RequestShape, RulesConfig};
use turnstile::{BucketStore, Orchestrator, PolicyBinding, Precision, RequestProcessor, Verdict};

/// Drive synthetic traffic through a rule set and report admission results.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Policy rules file (YAML); overrides `rules_path` from the config
    #[arg(short, long)]
    rules: Option<String>,

    /// Method every synthetic request calls
    #[arg(short, long)]
    method: String,

    /// Principal attached to every request
    #[arg(short, long)]
    principal: Option<String>,

    /// Request argument as `name=value`; may be repeated
    #[arg(short, long = "arg", value_parser = parse_arg)]
    args: Vec<(String, String)>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Requests in flight at once
    #[arg(short = 'j', long, default_value_t = 10)]
    concurrency: usize,

    /// Upper bound on how long an accepted request holds its leases
    #[arg(long, default_value_t = 20)]
    hold_ms: u64,

    /// Override the configured precision mode
    #[arg(long, value_enum)]
    precision: Option<Precision>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn parse_arg(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{}'", raw)),
    }
}

/// A synthetic request.
struct SimRequest {
    id: Uuid,
    shape: RequestShape,
}

/// Processor that discovers policies from the rule registry and simulates
/// work for accepted requests.
struct SimProcessor {
    registry: PolicyRegistry,
    hold_ms: u64,
    accepted: AtomicU64,
    denied: AtomicU64,
}

#[async_trait]
impl RequestProcessor for SimProcessor {
    type Request = SimRequest;
    type Output = ();

    async fn discover_policies(
        &self,
        request: &SimRequest,
    ) -> turnstile::Result<Vec<PolicyBinding>> {
        self.registry.bindings(&request.shape)
    }

    async fn on_accept(&self, request: &SimRequest) -> turnstile::Result<()> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let hold = rand::thread_rng().gen_range(0..=self.hold_ms);
        debug!(request_id = %request.id, hold_ms = hold, "Request accepted");
        tokio::time::sleep(Duration::from_millis(hold)).await;
        Ok(())
    }

    async fn on_deny(&self, request: &SimRequest) -> turnstile::Result<()> {
        self.denied.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request.id, "Request denied");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    method: String,
    precision: Precision,
    requests: usize,
    accepted: u64,
    denied: u64,
    failed: u64,
    elapsed_ms: u64,
    remaining_buckets: usize,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Turnstile simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(precision) = args.precision {
        config.store.precision = precision;
    }
    if args.concurrency == 0 {
        bail!("concurrency must be at least 1");
    }

    let rules_path = args
        .rules
        .clone()
        .or_else(|| config.rules_path.clone())
        .context("no rules file given; pass --rules or set rules_path")?;
    let rules = RulesConfig::from_file(&rules_path)?;

    let store = BucketStore::new(config.store.precision);
    let registry = PolicyRegistry::from_config(&rules, &store);
    info!(?registry, precision = ?store.precision(), "Configuration loaded");

    let processor = SimProcessor {
        registry,
        hold_ms: args.hold_ms,
        accepted: AtomicU64::new(0),
        denied: AtomicU64::new(0),
    };
    let orchestrator = Arc::new(Orchestrator::from_config(processor, &config.orchestrator));

    let mut shape = RequestShape::new(args.method.clone());
    if let Some(principal) = &args.principal {
        shape = shape.with_principal(principal.clone());
    }
    for (name, value) in &args.args {
        shape = shape.with_arg(name.clone(), value.clone());
    }

    let failed = Arc::new(AtomicU64::new(0));
    let started = std::time::Instant::now();

    let traffic = futures::stream::iter(0..args.requests)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let failed = Arc::clone(&failed);
            let request = SimRequest {
                id: Uuid::new_v4(),
                shape: shape.clone(),
            };
            let span = tracing::debug_span!("request", id = %request.id);
            async move {
                match orchestrator.process(&request).await {
                    Ok(Verdict::Accepted(())) | Ok(Verdict::Denied(())) => {}
                    Err(e) => {
                        warn!(error = %e, "Request failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            .instrument(span)
        })
        .buffer_unordered(args.concurrency)
        .collect::<Vec<()>>();

    tokio::select! {
        _ = traffic => {}
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, stopping simulation"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    }

    let processor = orchestrator.processor();
    let summary = Summary {
        method: args.method.clone(),
        precision: store.precision(),
        requests: args.requests,
        accepted: processor.accepted.load(Ordering::Relaxed),
        denied: processor.denied.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis() as u64,
        remaining_buckets: store.bucket_count(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}: {} requests, {} accepted, {} denied, {} failed in {}ms ({} buckets left)",
            summary.method,
            summary.requests,
            summary.accepted,
            summary.denied,
            summary.failed,
            summary.elapsed_ms,
            summary.remaining_buckets
        );
    }

    store.shutdown();
    info!("Turnstile simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("id=42").unwrap(), ("id".to_string(), "42".to_string()));
        assert_eq!(parse_arg("q=a=b").unwrap(), ("q".to_string(), "a=b".to_string()));
        assert!(parse_arg("novalue").is_err());
        assert!(parse_arg("=x").is_err());
    }

    #[test]
    fn test_precision_flag() {
        let args =
            Args::try_parse_from(["turnstile", "-m", "m", "--precision", "performance"]).unwrap();
        assert_eq!(args.precision, Some(Precision::Performance));
        assert!(Args::try_parse_from(["turnstile", "-m", "m", "--precision", "fast"]).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "turnstile",
            "--method",
            "orders.get",
            "--arg",
            "order_id=7",
            "-n",
            "5",
            "--precision",
            "strict",
        ])
        .unwrap();
        assert_eq!(args.method, "orders.get");
        assert_eq!(args.args, vec![("order_id".to_string(), "7".to_string())]);
        assert_eq!(args.requests, 5);
        assert_eq!(args.precision, Some(Precision::Strict));
    }
}
