//! Capability scopes and permissions
//!
//! A [`Permission`] is one `(method, path-regex)` rule. A scope is a named
//! collection of permissions, registered once at startup in a
//! [`ScopeRegistry`] and immutable thereafter. Scopes backed by plugins may
//! additionally observe upstream response bodies through
//! [`ScopeProvider::on_response`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::{Error, Result};

// ============================================================================
// Permissions
// ============================================================================

/// One capability rule: an HTTP method (or `*`) plus a path regex.
///
/// The path regex is anchored at the start of the request path, so `/` grants
/// every path and `/repos/[^/]+$` grants exactly one path segment under
/// `/repos/`. Paths are matched with their leading slash and without the
/// query string.
#[derive(Debug, Clone)]
pub struct Permission {
    method: String,
    pattern: String,
    path: Regex,
}

impl Permission {
    /// Build a permission from a method token and a path regex.
    ///
    /// # Errors
    ///
    /// Fails if the path regex does not compile.
    pub fn new(method: &str, path: &str) -> Result<Self> {
        let anchored = Regex::new(&format!("^(?:{path})")).map_err(|e| {
            Error::InvalidPermission(format!("path regex {path:?} does not compile: {e}"))
        })?;
        Ok(Self {
            method: method.to_string(),
            pattern: path.to_string(),
            path: anchored,
        })
    }

    /// Parse the `"METHOD path_regex"` string form (single space separator).
    pub fn parse(value: &str) -> Result<Self> {
        let Some((method, path)) = value.split_once(' ') else {
            return Err(Error::InvalidPermission(format!(
                "a permission should be a \"METHOD path_regex\", got {value:?}"
            )));
        };
        Self::new(method, path)
    }

    /// Whether this rule grants `(method, path)`.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.method == method || self.method == "*") && self.path.is_match(path)
    }

    /// The method token (`GET`, `POST`, ... or `*`).
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw path regex this permission was built from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Serialized form of a permission, as embedded in token claims and accepted
/// in config/plugin files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    /// HTTP method token or `*`.
    pub method: String,
    /// Path regex, anchored at the start of the request path.
    pub path: String,
}

impl TryFrom<&PermissionSpec> for Permission {
    type Error = Error;

    fn try_from(spec: &PermissionSpec) -> Result<Self> {
        Self::new(&spec.method, &spec.path)
    }
}

impl From<&Permission> for PermissionSpec {
    fn from(permission: &Permission) -> Self {
        Self {
            method: permission.method.clone(),
            path: permission.pattern.clone(),
        }
    }
}

/// A permission as written in config and plugin files: either the
/// `"METHOD path_regex"` string form or the `{method, path}` mapping form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionEntry {
    /// `"METHOD path_regex"`
    Rule(String),
    /// `{method: ..., path: ...}`
    Spec(PermissionSpec),
}

impl PermissionEntry {
    /// Compile the entry into a [`Permission`].
    pub fn compile(&self) -> Result<Permission> {
        match self {
            Self::Rule(rule) => Permission::parse(rule),
            Self::Spec(spec) => Permission::try_from(spec),
        }
    }
}

// ============================================================================
// Scope providers
// ============================================================================

/// Byte reader handed to response observers.
pub type ResponseBody = Pin<Box<dyn AsyncRead + Send>>;

/// A named capability set, optionally observing upstream response bodies.
///
/// Static scopes from config carry permissions only. Plugin scopes may also
/// implement [`ScopeProvider::on_response`], which the engine invokes
/// fire-and-forget after the upstream response arrives: implementations log
/// their own failures and must never assume the body is complete; under
/// backpressure the observed stream may be cut short.
#[async_trait]
pub trait ScopeProvider: Send + Sync {
    /// Capability rules granted by this scope.
    fn permissions(&self) -> &[Permission];

    /// Whether [`ScopeProvider::on_response`] does anything.
    fn has_response_callback(&self) -> bool {
        false
    }

    /// Observe an upstream response body.
    async fn on_response(
        &self,
        _method: &str,
        _path: &str,
        _body: ResponseBody,
        _status: u16,
        _scope_names: &[String],
    ) {
    }
}

/// A scope holding a fixed permission list (the config-file kind).
pub struct StaticScope {
    permissions: Vec<Permission>,
}

impl StaticScope {
    /// Create a static scope from compiled permissions.
    #[must_use]
    pub fn new(permissions: Vec<Permission>) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl ScopeProvider for StaticScope {
    fn permissions(&self) -> &[Permission] {
        &self.permissions
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Named scopes known to this proxy. Populated at startup from config and
/// plugin discovery, then read-only for the process lifetime.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, Arc<dyn ScopeProvider>>,
}

impl ScopeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope under a unique name.
    ///
    /// # Errors
    ///
    /// Fails if the name is already taken (config and plugins collide).
    pub fn insert(&mut self, name: String, provider: Arc<dyn ScopeProvider>) -> Result<()> {
        if self.scopes.contains_key(&name) {
            return Err(Error::Config(format!("duplicate scope name: {name:?}")));
        }
        self.scopes.insert(name, provider);
        Ok(())
    }

    /// Look up a scope by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScopeProvider>> {
        self.scopes.get(name)
    }

    /// Whether a scope with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// All scope names, sorted for stable display.
    #[must_use]
    pub fn sorted_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scopes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_matches_method_and_path() {
        let permission = Permission::parse("GET /repos/.*").unwrap();
        assert!(permission.matches("GET", "/repos/owner/name"));
        assert!(!permission.matches("POST", "/repos/owner/name"));
        assert!(!permission.matches("GET", "/orgs/acme"));
    }

    #[test]
    fn wildcard_method_matches_everything() {
        let permission = Permission::parse("* /status").unwrap();
        assert!(permission.matches("GET", "/status"));
        assert!(permission.matches("DELETE", "/status"));
    }

    #[test]
    fn path_regex_is_anchored_at_the_start() {
        let permission = Permission::parse("GET /repos").unwrap();
        // prefix match: anything under /repos is granted...
        assert!(permission.matches("GET", "/repos/owner"));
        // ...but the pattern must match from the first byte
        assert!(!permission.matches("GET", "/api/repos"));
    }

    #[test]
    fn end_anchor_is_honored() {
        let permission = Permission::parse("GET /exact$").unwrap();
        assert!(permission.matches("GET", "/exact"));
        assert!(!permission.matches("GET", "/exact/sub"));
    }

    #[test]
    fn method_comparison_is_case_sensitive() {
        let permission = Permission::parse("GET /").unwrap();
        assert!(!permission.matches("get", "/"));
    }

    #[test]
    fn bad_regex_fails_to_parse() {
        assert!(Permission::parse("GET /(unclosed").is_err());
    }

    #[test]
    fn missing_separator_fails_to_parse() {
        assert!(Permission::parse("GET").is_err());
    }

    #[test]
    fn entry_compiles_both_forms() {
        let rule = PermissionEntry::Rule("GET /.*".to_string());
        let spec = PermissionEntry::Spec(PermissionSpec {
            method: "POST".to_string(),
            path: "/items".to_string(),
        });

        assert_eq!(rule.compile().unwrap().method(), "GET");
        assert_eq!(spec.compile().unwrap().pattern(), "/items");
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ScopeRegistry::new();
        registry
            .insert("ci".to_string(), Arc::new(StaticScope::new(Vec::new())))
            .unwrap();

        let duplicate = registry.insert("ci".to_string(), Arc::new(StaticScope::new(Vec::new())));
        assert!(duplicate.is_err());
    }

    #[test]
    fn registry_sorted_names_are_stable() {
        let mut registry = ScopeRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .insert(name.to_string(), Arc::new(StaticScope::new(Vec::new())))
                .unwrap();
        }
        assert_eq!(registry.sorted_names(), ["alpha", "mid", "zeta"]);
    }
}
