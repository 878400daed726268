//! Static policy rules and the registry built from them.
//!
//! Rules map a method name to the policies that guard it and describe how
//! each policy's scope key is derived from a request. The registry resolves
//! every rule against a [`BucketStore`] once, at startup, so discovery at
//! request time is a map lookup plus key formatting.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{BucketStore, Policy, PolicyBinding, PolicySpec, ScopeKey};
use crate::error::{Result, TurnstileError};

/// A complete rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Guarded methods
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Policies applied to one method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Method name the request processor reports
    pub method: String,
    /// Policies evaluated for every call of the method
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// One policy plus the request attributes that partition its buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(flatten)]
    pub spec: PolicySpec,
    /// Attributes joined into the scope key, in order. Empty means one
    /// bucket for the whole method.
    #[serde(default)]
    pub scope: Vec<ScopePart>,
}

/// A request attribute that contributes to a scope key.
///
/// Written as `principal` or `arg:<name>` in rule files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopePart {
    /// The authenticated caller, or `anonymous` when there is none
    Principal,
    /// A named request argument, which must be present
    Arg(String),
}

const ANONYMOUS: &str = "anonymous";

impl TryFrom<String> for ScopePart {
    type Error = TurnstileError;

    fn try_from(value: String) -> Result<Self> {
        if value == "principal" {
            return Ok(ScopePart::Principal);
        }
        match value.strip_prefix("arg:") {
            Some(name) if !name.is_empty() => Ok(ScopePart::Arg(name.to_string())),
            _ => Err(TurnstileError::Config(format!(
                "unknown scope part '{}', expected 'principal' or 'arg:<name>'",
                value
            ))),
        }
    }
}

impl From<ScopePart> for String {
    fn from(part: ScopePart) -> Self {
        part.to_string()
    }
}

impl fmt::Display for ScopePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePart::Principal => f.write_str("principal"),
            ScopePart::Arg(name) => write!(f, "arg:{}", name),
        }
    }
}

impl RulesConfig {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RulesConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy rules: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if route.method.is_empty() {
                return Err(TurnstileError::Config("route method must not be empty".to_string()));
            }
            if !seen.insert(route.method.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate route for method '{}'",
                    route.method
                )));
            }
        }
        Ok(())
    }
}

/// What discovery needs to know about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestShape {
    pub method: String,
    pub principal: Option<String>,
    pub args: BTreeMap<String, String>,
}

impl RequestShape {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

struct RegisteredPolicy {
    scope: Vec<ScopePart>,
    policy: Arc<dyn Policy>,
}

/// Method name to policy list, resolved against one bucket store.
pub struct PolicyRegistry {
    routes: HashMap<String, Vec<RegisteredPolicy>>,
}

impl PolicyRegistry {
    /// Instantiate every rule's policy from `store`.
    pub fn from_config(config: &RulesConfig, store: &BucketStore) -> Self {
        let routes: HashMap<String, Vec<RegisteredPolicy>> = config
            .routes
            .iter()
            .map(|route| {
                let policies = route
                    .policies
                    .iter()
                    .map(|rule| RegisteredPolicy {
                        scope: rule.scope.clone(),
                        policy: store.policy(&rule.spec),
                    })
                    .collect();
                (route.method.clone(), policies)
            })
            .collect();

        info!(routes = routes.len(), "Policy registry built");
        Self { routes }
    }

    /// Bind each policy guarding the request's method to its scope key.
    ///
    /// Fails without producing any binding if a key cannot be built. An
    /// unknown method is unguarded and yields no bindings.
    pub fn bindings(&self, request: &RequestShape) -> Result<Vec<PolicyBinding>> {
        let Some(policies) = self.routes.get(&request.method) else {
            debug!(method = %request.method, "No policies registered for method");
            return Ok(Vec::new());
        };

        policies
            .iter()
            .map(|registered| {
                let scope = Self::scope_key(&request.method, &registered.scope, request)?;
                Ok(PolicyBinding::new(scope, Arc::clone(&registered.policy)))
            })
            .collect()
    }

    fn scope_key(method: &str, parts: &[ScopePart], request: &RequestShape) -> Result<ScopeKey> {
        let mut builder = ScopeKey::builder(method);
        for part in parts {
            builder = match part {
                ScopePart::Principal => {
                    builder.principal(request.principal.as_deref().unwrap_or(ANONYMOUS))
                }
                ScopePart::Arg(name) => {
                    let value = request.args.get(name).ok_or_else(|| {
                        TurnstileError::ScopeKey(format!(
                            "method '{}' has no argument '{}'",
                            method, name
                        ))
                    })?;
                    builder.discriminator(name.as_str(), value.as_str())
                }
            };
        }
        Ok(builder.build())
    }

    /// Number of guarded methods.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.routes.keys().collect();
        methods.sort();
        f.debug_struct("PolicyRegistry").field("methods", &methods).finish()
    }
}
