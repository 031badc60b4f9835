//! Server configuration: a TOML file overridden by command-line flags

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use keel_ledger::LedgerConfig;
use keel_logging::LogConfig;

use crate::error::ServerError;

/// Everything the server needs to start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    pub listen: SocketAddr,
    /// Ledger storage, reconciliation and maintenance settings
    pub ledger: LedgerConfig,
    pub logging: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7700)),
            ledger: LedgerConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ServerError> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Resolve the final configuration from command-line arguments
    ///
    /// A missing default config file is not an error; an explicitly
    /// named one is.
    pub fn from_args(args: &Args) -> Result<Self, ServerError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)?
                } else {
                    Self::default()
                }
            }
        };
        args.apply(&mut config);
        Ok(config)
    }
}

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "keel.toml";

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "keel-server", about = "Signal ledger with crash-safe framing and reconciliation")]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Ledger data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Human-readable console logs instead of JSONL
    #[arg(long)]
    pub pretty: bool,

    /// Run the background seal and reconcile task
    #[arg(long)]
    pub maintenance: bool,
}

impl Args {
    /// Override file settings with the flags that were given
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(dir) = &self.data_dir {
            config.ledger.data_dir = dir.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(level) = &self.log_level {
            config.logging.default_level = level.clone();
        }
        if self.pretty {
            config.logging.console.pretty = true;
            config.logging.console.ansi = true;
        }
        if self.maintenance {
            config.ledger.maintenance.enabled = true;
        }
    }
}
