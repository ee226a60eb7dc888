//! Plugin scope discovery
//!
//! A plugin directory is scanned once at startup. Every YAML file in it
//! contributes one named scope: a permission list, plus an optional
//! `on_response` sink that receives upstream response bodies the proxy
//! observed for that scope. Delivery is fire-and-forget; a sink that fails
//! or falls behind never affects the client.
//!
//! Hidden files are skipped; a file that fails to parse is logged and
//! skipped so one broken plugin cannot take the proxy down.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::scopes::{Permission, PermissionEntry, ResponseBody, ScopeProvider, ScopeRegistry};
use crate::{Error, Result};

const HEADER_METHOD: HeaderName = HeaderName::from_static("x-magicproxy-method");
const HEADER_PATH: HeaderName = HeaderName::from_static("x-magicproxy-path");
const HEADER_STATUS: HeaderName = HeaderName::from_static("x-magicproxy-status");
const HEADER_SCOPES: HeaderName = HeaderName::from_static("x-magicproxy-scopes");

/// One plugin definition file.
#[derive(Debug, Deserialize)]
struct PluginFile {
    /// Scope name contributed to the registry.
    name: String,
    /// Permission entries, string or mapping form.
    permissions: Vec<PermissionEntry>,
    /// Optional response sink.
    #[serde(default)]
    on_response: Option<ResponseSink>,
}

/// Where observed response bodies are delivered.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseSink {
    /// Delivery URL.
    pub url: String,
    /// HTTP method used for delivery (default POST).
    #[serde(default = "default_sink_method")]
    pub method: String,
}

fn default_sink_method() -> String {
    "POST".to_string()
}

/// A scope contributed by a plugin file.
pub struct PluginScope {
    permissions: Vec<Permission>,
    sink: Option<ResponseSink>,
    http: reqwest::Client,
}

#[async_trait]
impl ScopeProvider for PluginScope {
    fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    fn has_response_callback(&self) -> bool {
        self.sink.is_some()
    }

    async fn on_response(
        &self,
        method: &str,
        path: &str,
        body: ResponseBody,
        status: u16,
        scope_names: &[String],
    ) {
        let Some(sink) = &self.sink else { return };

        let sink_method = sink.method.parse::<reqwest::Method>().unwrap_or_else(|_| {
            warn!(method = %sink.method, "Unusable sink method, falling back to POST");
            reqwest::Method::POST
        });

        // The observed body streams straight through to the sink; it is
        // never buffered here.
        let request = self
            .http
            .request(sink_method, &sink.url)
            .header(HEADER_METHOD, sanitized(method))
            .header(HEADER_PATH, sanitized(path))
            .header(HEADER_STATUS, status)
            .header(HEADER_SCOPES, sanitized(&scope_names.join(" ")))
            .body(reqwest::Body::wrap_stream(ReaderStream::new(body)));

        match request.send().await {
            Ok(response) => {
                debug!(url = %sink.url, status = %response.status(), "Delivered observed response");
            }
            Err(e) => {
                error!(url = %sink.url, error = %e, "Response sink delivery failed");
            }
        }
    }
}

fn sanitized(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

/// Scan `dir` and register every plugin scope found in it.
///
/// Returns the number of scopes registered.
///
/// # Errors
///
/// Fails if `dir` is not a directory or if a plugin name collides with an
/// already registered scope.
pub fn load_plugins(dir: &Path, registry: &mut ScopeRegistry) -> Result<usize> {
    if !dir.is_dir() {
        return Err(Error::Config(format!(
            "Plugins path is not a directory: {}",
            dir.display()
        )));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    let http = reqwest::Client::builder().build()?;

    let mut loaded = 0;
    for path in paths {
        if path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        {
            continue;
        }
        if !path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            continue;
        }

        match load_plugin_file(&path, http.clone()) {
            Ok((name, scope)) => {
                debug!(scope = %name, path = %path.display(), "Loaded plugin scope");
                registry.insert(name, Arc::new(scope))?;
                loaded += 1;
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Failed to load plugin scope");
            }
        }
    }

    info!(count = loaded, path = %dir.display(), "Loaded plugin scopes");
    Ok(loaded)
}

fn load_plugin_file(path: &Path, http: reqwest::Client) -> Result<(String, PluginScope)> {
    let raw = std::fs::read_to_string(path)?;
    let file: PluginFile = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid plugin file: {e}")))?;

    let permissions = file
        .permissions
        .iter()
        .map(PermissionEntry::compile)
        .collect::<Result<Vec<_>>>()?;

    Ok((
        file.name,
        PluginScope {
            permissions,
            sink: file.on_response,
            http,
        },
    ))
}
