//! Command-line and file configuration.

use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub use clap::Parser;
use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::Room;

/// Default Matrix message type for probes and replies.
pub const DEFAULT_MESSAGE_TYPE: &str = "m.notice";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line options of the exporter.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Matrix-IRC bridge latency exporter", long_about = None)]
pub struct Configuration {
    /// Listen address for the metrics endpoint
    #[clap(short, long, default_value = "0.0.0.0:9200")]
    pub addr: SocketAddr,
    /// Configuration file
    #[clap(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Time to wait for replies per scrape, in seconds
    #[clap(short, long, default_value_t = 60)]
    pub timeout: u64,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(short, long, default_value = "info")]
    pub log_level: LevelFilter,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.timeout == 0 {
            return Err(ConfigurationError::Invalid(
                "Timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Command-line options of the standalone IRC ping responder.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "IRC ping responder", long_about = None)]
pub struct ResponderConfiguration {
    /// IRC server to connect to
    #[clap(short, long, default_value = "localhost:6667")]
    pub server: String,
    /// Nickname to use
    #[clap(short, long, default_value = "PingBot")]
    pub nick: String,
    /// Real name to use
    #[clap(long, default_value = "PingBot")]
    pub name: String,
    /// Comma separated list of channels to join
    #[clap(short, long, value_delimiter = ',')]
    pub channels: Vec<String>,
    /// Use TLS for this connection
    #[clap(long)]
    pub tls: bool,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(short, long, default_value = "info")]
    pub log_level: LevelFilter,
}

impl ResponderConfiguration {
    pub fn irc_config(&self) -> IrcConfig {
        IrcConfig {
            server: self.server.clone(),
            nick: self.nick.clone(),
            name: self.name.clone(),
            tls: self.tls,
            channels: self
                .channels
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

/// Contents of the configuration file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FileConfig {
    pub matrix: MatrixConfig,
    /// IRC responders keyed by network name.
    #[serde(default)]
    pub irc: BTreeMap<String, IrcConfig>,
}

/// Matrix account used to send probes.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MatrixConfig {
    /// Homeserver base URL, e.g. `https://matrix.example.org`.
    pub homeserver: String,
    /// Full user id, e.g. `@pinger:example.org`.
    pub user: String,
    /// Access token.
    pub token: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Probed rooms: network name to room id or alias.
    #[serde(default)]
    pub rooms: BTreeMap<String, String>,
}

/// IRC connection used by a ping responder.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IrcConfig {
    /// `host:port` of the IRC server.
    pub server: String,
    pub nick: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "ssl")]
    pub tls: bool,
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

impl FileConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<FileConfig, ConfigurationError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FileConfig = data.parse()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.matrix.validate()?;
        for (network, irc) in &self.irc {
            irc.validate()
                .map_err(|e| ConfigurationError::Invalid(format!("irc.{}: {}", network, e)))?;
        }
        Ok(())
    }

    /// Probed rooms as configured, with destinations not yet resolved.
    pub fn rooms(&self) -> Vec<Room> {
        self.matrix
            .rooms
            .iter()
            .map(|(name, room)| Room::new(name.clone(), room.clone()))
            .collect()
    }
}

impl std::str::FromStr for FileConfig {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl MatrixConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.homeserver.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "matrix.homeserver is required".to_string(),
            ));
        }
        url::Url::parse(&self.homeserver).map_err(|e| {
            ConfigurationError::Invalid(format!("matrix.homeserver is not a URL: {}", e))
        })?;
        if self.token.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "matrix.token is required".to_string(),
            ));
        }
        if self.rooms.is_empty() {
            return Err(ConfigurationError::Invalid(
                "at least one room must be configured in matrix.rooms".to_string(),
            ));
        }
        if let Some((name, _)) = self.rooms.iter().find(|(_, r)| r.trim().is_empty()) {
            return Err(ConfigurationError::Invalid(format!(
                "matrix.rooms.{} has no room id",
                name
            )));
        }
        Ok(())
    }
}

impl IrcConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.server.trim().is_empty() {
            return Err(ConfigurationError::Invalid("server is required".to_string()));
        }
        if self.nick.trim().is_empty() || self.nick.contains(char::is_whitespace) {
            return Err(ConfigurationError::Invalid(format!(
                "invalid nick {:?}",
                self.nick
            )));
        }
        Ok(())
    }

    /// Real name, falling back to the nick.
    pub fn realname(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.nick
        } else {
            &self.name
        }
    }
}
