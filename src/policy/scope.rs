//! Scope key generation and handling.

use std::fmt;
use std::sync::Arc;

/// A key that identifies the allocation bucket a request falls into.
///
/// Policies treat the key as opaque. It is cheap to clone, so the same key
/// can be handed to several concurrent evaluations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeKey(Arc<str>);

impl ScopeKey {
    /// Create a scope key from a raw string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Start building a key for a method.
    pub fn builder(method: &str) -> ScopeKeyBuilder {
        ScopeKeyBuilder {
            method: method.to_string(),
            principal: None,
            discriminators: Vec::new(),
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ScopeKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Composes a [`ScopeKey`] from a method, an optional principal and any
/// number of named discriminators.
///
/// Entries are serialized in insertion order, so callers must add them in a
/// consistent order for the same logical scope. Separator characters inside
/// a component are escaped with `\`, so distinct components never produce
/// the same key.
#[derive(Debug, Clone)]
pub struct ScopeKeyBuilder {
    method: String,
    principal: Option<String>,
    discriminators: Vec<(String, String)>,
}

impl ScopeKeyBuilder {
    /// Scope the key to an authenticated principal.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Add a named discriminator, e.g. a value taken from a request argument.
    pub fn discriminator(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.discriminators.push((name.into(), value.into()));
        self
    }

    /// Format: `method[@principal][|name=value,...]`
    pub fn build(self) -> ScopeKey {
        let mut key = String::with_capacity(self.method.len());
        push_escaped(&mut key, &self.method);

        if let Some(principal) = &self.principal {
            key.push('@');
            push_escaped(&mut key, principal);
        }

        for (i, (name, value)) in self.discriminators.iter().enumerate() {
            key.push(if i == 0 { '|' } else { ',' });
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, value);
        }

        ScopeKey::from(key)
    }
}

const SEPARATORS: [char; 5] = ['\\', '@', '|', ',', '='];

fn push_escaped(key: &mut String, component: &str) {
    for c in component.chars() {
        if SEPARATORS.contains(&c) {
            key.push('\\');
        }
        key.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_method_only() {
        let key = ScopeKey::builder("orders.create").build();
        assert_eq!(key.as_str(), "orders.create");
    }

    #[test]
    fn test_scope_key_to_string() {
        let key = ScopeKey::builder("orders.create")
            .principal("alice")
            .discriminator("tenant", "acme")
            .discriminator("region", "eu")
            .build();

        assert_eq!(key.to_string(), "orders.create@alice|tenant=acme,region=eu");
    }

    #[test]
    fn test_scope_key_equality() {
        let key1 = ScopeKey::builder("m").principal("bob").build();
        let key2 = ScopeKey::builder("m").principal("bob").build();
        let key3 = ScopeKey::builder("m").principal("carol").build();

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1, ScopeKey::from("m@bob"));
    }

    #[test]
    fn test_discriminators_change_key() {
        let key1 = ScopeKey::builder("m").discriminator("id", "1").build();
        let key2 = ScopeKey::builder("m").discriminator("id", "2").build();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_separators_in_values_are_escaped() {
        let key1 = ScopeKey::builder("m")
            .discriminator("a", "1,b=2")
            .discriminator("b", "3")
            .build();
        let key2 = ScopeKey::builder("m")
            .discriminator("a", "1")
            .discriminator("b", "2,b=3")
            .build();
        assert_ne!(key1, key2);
        assert_eq!(key1.as_str(), r"m|a=1\,b\=2,b=3");
        assert_eq!(key2.as_str(), r"m|a=1,b=2\,b\=3");
    }

    #[test]
    fn test_principal_cannot_impersonate_discriminator() {
        let key1 = ScopeKey::builder("m").principal("x|k=v").build();
        let key2 = ScopeKey::builder("m").principal("x").discriminator("k", "v").build();
        assert_ne!(key1, key2);

        let key3 = ScopeKey::builder("m@x").build();
        let key4 = ScopeKey::builder("m").principal("x").build();
        assert_ne!(key3, key4);

        let key5 = ScopeKey::builder("m").principal(r"x\").build();
        let key6 = ScopeKey::builder("m").principal("x").build();
        assert_ne!(key5, key6);
    }
}
