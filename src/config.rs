//! Configuration management
//!
//! Configuration merges three layers, later winning: serde defaults, a YAML
//! config file, and `MAGICPROXY_`-prefixed environment variables (nested
//! keys split on `__`, e.g. `MAGICPROXY_SERVER__PORT`). CLI flags override
//! on top in `main`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scopes::{PermissionEntry, ScopeRegistry, StaticScope};
use crate::{Error, Result};

/// Upstream origin proxied when none is configured.
pub const DEFAULT_API_ROOT: &str = "https://api.github.com";
/// Externally reachable proxy URL when none is configured.
pub const DEFAULT_PUBLIC_ACCESS: &str = "http://localhost:5000";
const DEFAULT_KEYS_LOCATION: &str = "keys";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded into the process environment before the
    /// env-var layer is merged. Later files override earlier ones.
    pub env_files: Vec<String>,
    /// Server bind configuration.
    pub server: ServerConfig,
    /// Upstream API origin proxied requests are joined to.
    pub api_root: String,
    /// Externally reachable URL of this proxy (certificate CN source).
    pub public_access: String,
    /// Directory holding `private.pem`, `public.pem` and `public.x509.cer`.
    /// The individual locations below take precedence when set.
    pub keys_location: Option<String>,
    /// Private key path (overrides `keys_location`).
    pub private_key_location: Option<String>,
    /// Public key path (written by `generate-keys`; overrides `keys_location`).
    pub public_key_location: Option<String>,
    /// Certificate path (overrides `keys_location`).
    pub public_certificate_location: Option<String>,
    /// Named scopes: scope name → permission list, each entry either
    /// `"METHOD path_regex"` or `{method, path}`.
    pub scopes: HashMap<String, Vec<PermissionEntry>>,
    /// Directory of plugin scope definitions, scanned at startup.
    pub plugins_location: Option<String>,
    /// Query parameters removed from forwarded paths.
    pub query_params_to_clean: HashSet<String>,
    /// Extra request headers dropped before forwarding upstream.
    pub request_headers_to_clean: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            api_root: DEFAULT_API_ROOT.to_string(),
            public_access: DEFAULT_PUBLIC_ACCESS.to_string(),
            keys_location: None,
            private_key_location: None,
            public_key_location: None,
            public_certificate_location: None,
            scopes: HashMap::new(),
            plugins_location: None,
            query_params_to_clean: HashSet::new(),
            request_headers_to_clean: HashSet::new(),
        }
    }
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is named but missing, or if any layer
    /// fails to parse into the config shape.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files named in the file layer are loaded into the process
        // environment before the env-var layer is read.
        let file_only: Self = figment
            .clone()
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        file_only.load_env_files();

        let config: Self = figment
            .merge(Env::prefixed("MAGICPROXY_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        debug!(
            api_root = %config.api_root,
            scopes = config.scopes.len(),
            plugins_location = config.plugins_location.as_deref().unwrap_or("<none>"),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn load_env_files(&self) {
        for file in &self.env_files {
            match dotenvy::from_path(file) {
                Ok(()) => debug!(file = %file, "Loaded environment file"),
                Err(e) => warn!(file = %file, error = %e, "Failed to load environment file"),
            }
        }
    }

    /// Path of the PEM PKCS#8 private key.
    #[must_use]
    pub fn private_key_location(&self) -> PathBuf {
        self.private_key_location
            .as_ref()
            .map_or_else(|| self.keys_dir().join("private.pem"), PathBuf::from)
    }

    /// Path of the PEM public key (written by `generate-keys`, not read by
    /// the proxy itself).
    #[must_use]
    pub fn public_key_location(&self) -> PathBuf {
        self.public_key_location
            .as_ref()
            .map_or_else(|| self.keys_dir().join("public.pem"), PathBuf::from)
    }

    /// Path of the PEM X.509 certificate.
    #[must_use]
    pub fn public_certificate_location(&self) -> PathBuf {
        self.public_certificate_location
            .as_ref()
            .map_or_else(|| self.keys_dir().join("public.x509.cer"), PathBuf::from)
    }

    fn keys_dir(&self) -> PathBuf {
        PathBuf::from(self.keys_location.as_deref().unwrap_or(DEFAULT_KEYS_LOCATION))
    }

    /// Compile the configured static scopes into a registry.
    ///
    /// Plugin scopes are added separately at gateway assembly.
    pub fn build_scope_registry(&self) -> Result<ScopeRegistry> {
        let mut registry = ScopeRegistry::new();
        for (name, entries) in &self.scopes {
            let permissions = entries
                .iter()
                .map(PermissionEntry::compile)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::Config(format!("scope {name:?}: {e}")))?;
            registry.insert(name.clone(), Arc::new(StaticScope::new(permissions)))?;
        }
        Ok(registry)
    }
}
