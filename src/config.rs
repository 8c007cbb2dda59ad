use std::{io, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime settings, read from a toml file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// port of the shared listening socket, also announced to trackers
    pub port: u16,
    /// where new transfers are stored unless the caller says otherwise
    pub download_dir: PathBuf,
    /// outgoing connection attempts in flight per transfer
    pub max_dial: usize,
    pub handshake_timeout_secs: u64,
    /// candidate addresses buffered between the downloader and the dialer
    pub peer_queue_size: usize,
    pub encryption: EncryptionConfig,
    pub tracker: TrackerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6881,
            download_dir: PathBuf::from("."),
            max_dial: 40,
            handshake_timeout_secs: 10,
            peer_queue_size: 200,
            encryption: EncryptionConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// dial with the plain handshake
    pub disable_outgoing: bool,
    /// never fall back to plaintext when dialing
    pub force_outgoing: bool,
    /// refuse incoming connections that are not encrypted
    pub force_incoming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// wait before announcing again after a failed announce
    pub retry_interval_secs: u64,
    pub num_want: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("swarmlink/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            retry_interval_secs: 60,
            num_want: 50,
        }
    }
}

impl TrackerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        Self::parse(&text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the config file at `{path}` with the error: `{error}`")]
    Read { path: PathBuf, error: io::Error },
    #[error("Failed to parse the config file at `{path}` with the error: `{error}`")]
    Parse {
        path: PathBuf,
        error: toml::de::Error,
    },
}
