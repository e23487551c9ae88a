//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cipher - service identity and access control for a mesh of services
#[derive(Parser, Debug)]
#[command(name = "cipher")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CIPHER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CIPHER_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CIPHER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the root CA (no-op if it already exists)
    Init,

    /// Issue or reissue a service certificate
    Enroll {
        /// Service name
        service: String,

        /// Enroll through a running CA server instead of the local CA.
        /// Without a URL, targets the configured control API address.
        #[arg(long, value_name = "URL")]
        server: Option<Option<String>>,
    },

    /// Run the end-to-end proxy scenario
    Demo {
        /// Number of outbound requests to simulate
        #[arg(long, default_value_t = 12)]
        requests: usize,
    },

    /// Start the CA control API
    CaServer {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show identity and validity of a certificate
    Inspect {
        /// Certificate file (PEM or DER)
        cert: PathBuf,
    },

    /// Validate a certificate against the root CA
    Validate {
        /// Certificate file (PEM or DER)
        cert: PathBuf,

        /// Root certificate to trust (defaults to the configured CA)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Print the effective configuration as YAML
    Config,
}
