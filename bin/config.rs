//! Configuration for the livestatus binary.
//!
//! Supports loading configuration from TOML files, environment variables,
//! or CLI arguments.

use std::{net::SocketAddr, path::Path, time::Duration};

use clap::{Parser, Subcommand};
use livestatus::{ChannelConfig, DEFAULT_BASE_URL, OrganizationId};
use serde::{Deserialize, Serialize};

/// CLI arguments for livestatus.
#[derive(Debug, Parser)]
#[command(name = "livestatus")]
#[command(about = "Live organization status feed over WebSocket")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "LIVESTATUS_CONFIG", global = true)]
    pub config: Option<String>,

    /// What to run.
    #[command(subcommand)]
    pub command: Mode,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Follow an organization's live status feed.
    Watch {
        /// Base URL of the stream endpoint.
        #[arg(long, env = "LIVESTATUS_WS_URL")]
        ws_url: Option<String>,

        /// Organization whose feed to follow.
        #[arg(long, env = "LIVESTATUS_ORGANIZATION")]
        organization: Option<String>,

        /// Viewer identity reported in logs.
        #[arg(long, env = "LIVESTATUS_VIEWER")]
        viewer: Option<String>,

        /// Keep-alive interval in seconds.
        #[arg(long, env = "LIVESTATUS_KEEP_ALIVE_SECS")]
        keep_alive_secs: Option<u64>,

        /// Reconnect delay in seconds.
        #[arg(long, env = "LIVESTATUS_RECONNECT_DELAY_SECS")]
        reconnect_delay_secs: Option<u64>,
    },
    /// Run the notification relay.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, env = "LIVESTATUS_BIND_ADDR")]
        bind_addr: Option<SocketAddr>,
    },
}

/// Configuration for livestatus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the stream endpoint.
    pub ws_url: String,

    /// Organization whose feed to follow.
    pub organization: Option<String>,

    /// Viewer identity.
    pub viewer: String,

    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,

    /// Reconnect delay in seconds.
    pub reconnect_delay_secs: u64,

    /// Address the relay binds to.
    pub bind_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            viewer: "cli".to_string(),
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            bind_addr: "127.0.0.1:8000".parse().unwrap(),
        }
    }
}

/// What the binary runs, with its merged configuration.
#[derive(Debug)]
pub enum Run {
    /// Follow a feed.
    Watch(Config),
    /// Serve the relay.
    Serve(Config),
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load configuration from CLI arguments, optionally overriding a config file.
    pub fn load() -> Result<Run, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    /// Merge parsed CLI arguments over the config file (if any).
    pub fn from_cli(cli: Cli) -> Result<Run, ConfigError> {
        let mut config =
            if let Some(ref path) = cli.config { Self::from_file(path)? } else { Self::default() };

        // CLI args override config file values
        match cli.command {
            Mode::Watch { ws_url, organization, viewer, keep_alive_secs, reconnect_delay_secs } => {
                if let Some(ws_url) = ws_url {
                    config.ws_url = ws_url;
                }
                if organization.is_some() {
                    config.organization = organization;
                }
                if let Some(viewer) = viewer {
                    config.viewer = viewer;
                }
                if let Some(secs) = keep_alive_secs {
                    config.keep_alive_secs = secs;
                }
                if let Some(secs) = reconnect_delay_secs {
                    config.reconnect_delay_secs = secs;
                }
                Ok(Run::Watch(config))
            }
            Mode::Serve { bind_addr } => {
                if let Some(bind_addr) = bind_addr {
                    config.bind_addr = bind_addr;
                }
                Ok(Run::Serve(config))
            }
        }
    }

    /// Builds the channel configuration.
    pub fn channel(&self) -> Result<ChannelConfig, ConfigError> {
        let mut channel = ChannelConfig::new(&self.ws_url)?;
        channel.keep_alive_interval = Duration::from_secs(self.keep_alive_secs.max(1));
        channel.reconnect_delay = Duration::from_secs(self.reconnect_delay_secs);
        Ok(channel)
    }

    /// Returns the organization to watch.
    pub fn organization(&self) -> Result<OrganizationId, ConfigError> {
        self.organization
            .as_deref()
            .and_then(OrganizationId::new)
            .ok_or(ConfigError::MissingOrganization)
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse configuration file.
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),

    /// Invalid channel settings.
    #[error(transparent)]
    Channel(#[from] livestatus::ConfigError),

    /// `watch` needs an organization.
    #[error("no organization given (use --organization or LIVESTATUS_ORGANIZATION)")]
    MissingOrganization,
}
