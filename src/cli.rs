//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authenticating API proxy: capability-scoped magic tokens for one upstream API
#[derive(Parser, Debug)]
#[command(name = "magicproxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MAGICPROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "MAGICPROXY_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "MAGICPROXY_PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MAGICPROXY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MAGICPROXY_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand; the default action is to serve.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Maintenance subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate the proxy keypair and self-signed certificate
    GenerateKeys,
}
