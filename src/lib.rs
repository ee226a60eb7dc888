//! magicproxy library
//!
//! An authenticating reverse proxy for a single upstream HTTP API. Clients
//! hold a **magic token** instead of the credential itself: a signed JWT
//! whose encrypted `token` claim hides the real upstream credential. The
//! proxy validates the token, checks the requested method and path against
//! the token's capabilities, substitutes the real credential, and streams
//! the request and response through bounded buffers.
//!
//! # Capabilities
//!
//! A token grants either an inline `allowed` list of `METHOD path-regex`
//! rules or one or more named scopes configured on the proxy. Plugin scopes
//! may additionally observe response bodies through a fire-and-forget side
//! channel that never blocks the client.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod keygen;
pub mod keys;
pub mod plugins;
pub mod queries;
pub mod scopes;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Proxy version reported by the identification endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
