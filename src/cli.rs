//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keyserver Gateway - mutually-authenticated HTTPS front end for a cluster keyserver
#[derive(Parser, Debug)]
#[command(name = "keygateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KEYGATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KEYGATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KEYGATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway (default)
    Serve {
        /// Listen address (`host:port`), overrides `server.listen`
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Write a development CA with server and client certificates
    DevPki {
        /// Output directory
        #[arg(short, long, default_value = "dev-pki")]
        out: PathBuf,

        /// Host names for the server certificate
        #[arg(long = "hostname", default_value = "localhost")]
        hostnames: Vec<String>,

        /// Common name of the client certificate
        #[arg(long, default_value = "dev-client")]
        client_cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,
    },
}
