//! Proxy server assembly and lifecycle

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::keys::KeyMaterial;
use crate::plugins;
use crate::{Error, Result};

/// The magic-token proxy server
pub struct Gateway {
    state: Arc<AppState>,
}

impl Gateway {
    /// Assemble a gateway: load key material, compile static scopes,
    /// discover plugin scopes, build the shared upstream client.
    ///
    /// # Errors
    ///
    /// Returns an error if key material is unreadable, a scope fails to
    /// compile, plugin discovery fails, or the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let keys = KeyMaterial::from_files(
            &config.private_key_location(),
            &config.public_certificate_location(),
        )?;

        let mut scopes = config.build_scope_registry()?;
        if let Some(dir) = config.plugins_location.as_deref() {
            plugins::load_plugins(Path::new(dir), &mut scopes)?;
        }
        for name in scopes.sorted_names() {
            debug!(scope = %name, "Scope registered");
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            state: Arc::new(AppState {
                config,
                keys,
                scopes,
                http,
            }),
        })
    }

    /// Router for this gateway, exposed for in-process serving in tests and
    /// for embedding.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Serve until interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address cannot be bound or the
    /// server fails while running.
    pub async fn run(self) -> Result<()> {
        let host = self.state.config.server.host.clone();
        let port = self.state.config.server.port;

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {host}:{port}: {e}")))?;

        info!(
            addr = %listener.local_addr()?,
            api_root = %self.state.config.api_root,
            scopes = self.state.scopes.len(),
            "magicproxy listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
