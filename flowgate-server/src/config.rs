//! Server configuration and CLI argument parsing
//!
//! Process options come from:
//! - Command-line arguments
//! - Environment variables (with FLOWGATE_ prefix)
//!
//! The flow control rules themselves live in a separate file (TOML, YAML or
//! JSON, see [`flowgate::FlowConfig`]) which can be reloaded at runtime.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Using CLI arguments
//! flowgate --port 8080 --rules flow.toml --upstream http://localhost:8081/geoserver
//!
//! # Using environment variables
//! export FLOWGATE_PORT=8080
//! export FLOWGATE_RULES=/etc/flowgate/flow.toml
//! flowgate
//!
//! # Mixed (CLI overrides env)
//! export FLOWGATE_PORT=8080
//! flowgate --port 9090  # Uses port 9090
//! ```

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use flowgate::FlowConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration structure for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listener
    pub http: HttpConfig,
    /// Flow control rule file; without one every request is admitted
    pub rules: Option<PathBuf>,
    /// Overrides `timeout_secs` from the rule file
    pub timeout_secs: Option<u64>,
    /// Server the admitted requests are forwarded to
    pub upstream: Option<String>,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl HttpConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// Command-line arguments for the server
///
/// All arguments can also be set via environment variables with the
/// FLOWGATE_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "flowgate",
    about = "Flow control gateway for OGC services",
    long_about = "Applies concurrency limits, priority queues and per-client rate limits to OGC requests before forwarding them upstream.\n\nEnvironment variables with FLOWGATE_ prefix are supported. CLI arguments take precedence over environment variables.\n\nSend SIGHUP to reload the rule file."
)]
pub struct Args {
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "FLOWGATE_HOST"
    )]
    pub host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 8080,
        env = "FLOWGATE_PORT"
    )]
    pub port: u16,

    #[arg(
        long,
        value_name = "FILE",
        help = "Flow control rule file (TOML, YAML or JSON)",
        env = "FLOWGATE_RULES"
    )]
    pub rules: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "Admission timeout, overrides the rule file",
        env = "FLOWGATE_TIMEOUT"
    )]
    pub timeout: Option<u64>,
    #[arg(
        long,
        value_name = "URL",
        help = "Forward admitted requests to this server",
        env = "FLOWGATE_UPSTREAM"
    )]
    pub upstream: Option<String>,

    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "FLOWGATE_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        let config = Self::from_args(args);
        config.validate()?;
        Ok(config)
    }

    fn from_args(args: Args) -> Self {
        Config {
            http: HttpConfig {
                host: args.host,
                port: args.port,
            },
            rules: args.rules,
            timeout_secs: args.timeout,
            upstream: args.upstream.map(|u| u.trim_end_matches('/').to_string()),
            log_level: args.log_level,
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable listen address, an upstream that is
    /// not an http(s) URL, or a missing rule file.
    pub fn validate(&self) -> Result<()> {
        self.http.addr()?;

        if let Some(upstream) = &self.upstream {
            if !(upstream.starts_with("http://") || upstream.starts_with("https://")) {
                return Err(anyhow!(
                    "Upstream must be an http:// or https:// URL, got {upstream:?}"
                ));
            }
        }

        if let Some(rules) = &self.rules {
            if !rules.is_file() {
                return Err(anyhow!("Rule file {} does not exist", rules.display()));
            }
        }

        Ok(())
    }

    /// Read the flow control rules, applying the CLI timeout override
    ///
    /// Without a rule file the defaults apply: no controllers, nothing
    /// blacklisted.
    pub fn load_rules(&self) -> Result<FlowConfig> {
        let mut flow = match &self.rules {
            Some(path) => load_rule_file(path)?,
            None => FlowConfig::default(),
        };
        if let Some(timeout) = self.timeout_secs {
            flow.timeout_secs = timeout;
        }
        Ok(flow)
    }

    fn print_env_vars() {
        println!("Flowgate Environment Variables");
        println!("==============================");
        println!();
        println!("All environment variables use the FLOWGATE_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("HTTP Configuration:");
        println!("  FLOWGATE_HOST=<host>          HTTP host [default: 127.0.0.1]");
        println!("  FLOWGATE_PORT=<port>          HTTP port [default: 8080]");
        println!();

        println!("Flow Control:");
        println!("  FLOWGATE_RULES=<file>         Rule file (TOML, YAML or JSON)");
        println!("  FLOWGATE_TIMEOUT=<secs>       Admission timeout, overrides the rule file");
        println!("  FLOWGATE_UPSTREAM=<url>       Forward admitted requests to this server");
        println!();

        println!("General Configuration:");
        println!(
            "  FLOWGATE_LOG_LEVEL=<level>    Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  # Protect a local GeoServer");
        println!("  export FLOWGATE_RULES=/etc/flowgate/flow.toml");
        println!("  export FLOWGATE_UPSTREAM=http://localhost:8081/geoserver");
        println!();
        println!("  # Run server (CLI args override env vars)");
        println!("  flowgate --port 9090  # Will use port 9090");
    }
}

/// Parse a rule file; the format follows the file extension
pub fn load_rule_file(path: &Path) -> Result<FlowConfig> {
    config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .and_then(|c| c.try_deserialize::<FlowConfig>())
        .with_context(|| format!("Failed to load rule file {}", path.display()))
}
