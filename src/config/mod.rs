//! Configuration management for Tributary.
//!
//! Configuration is read from `~/.config/tributary/config.toml` at startup
//! unless another path is given on the command line. If the file doesn't
//! exist, a default configuration with comments is created.

pub mod duration;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::controller::ControllerConfig;
use crate::delivery::telegram::TelegramConfig;
use crate::delivery::DeliveryConfig;
use crate::mediator::MediatorConfig;
use crate::scheduler::SchedulerConfig;
use crate::vendor::imageboard::ImageboardConfig;
use crate::vendor::subreddit::RedditConfig;

pub use duration::{format_duration, parse_duration};

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub mediator: MediatorConfig,
    pub delivery: DeliveryConfig,
    pub platform: TelegramConfig,
    pub controller: ControllerConfig,
    pub imageboard: ImageboardConfig,
    pub reddit: RedditConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file is created with commented defaults. A file given
    /// explicitly must exist. Missing fields use default values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default_path = Self::default_config_path()?;
                if !default_path.exists() {
                    Self::create_default_config(&default_path)?;
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
            path: config_path.clone(),
            source: e,
        })?;

        let config = Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: config_path.clone(),
            source: e,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: config_path,
            reason,
        })?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject values that parse fine but cannot drive the service.
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.poll_interval.is_zero() {
            return Err("scheduler.poll_interval must be greater than zero".into());
        }
        if self.scheduler.sweep_interval.is_zero() {
            return Err("scheduler.sweep_interval must be greater than zero".into());
        }
        if self.mediator.timeout.is_zero() {
            return Err("mediator.timeout must be greater than zero".into());
        }
        Ok(())
    }

    /// Get the default config file path: `~/.config/tributary/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("tributary").join("config.toml"))
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Tributary Configuration
#
# Durations accept "500ms", "30s", "5m", "1h", "1d" or a number of seconds.

[store]
# SQLite database path (default: <data dir>/tributary/tributary.db)
# path = "/var/lib/tributary/tributary.db"

[scheduler]
# Pause between two refreshes of the same feed
poll_interval = "1m"

# How often idle feeds are re-checked and caches are cleaned
sweep_interval = "5m"

# Media signatures not seen for this long are forgotten
media_hash_retention = "30d"

[mediator]
# Media pipelines running at the same time
concurrency = 4

# Media up to this size is sent as a link the platform fetches itself
remote_link_max_bytes = 20971520

# Media up to this size is downloaded and uploaded with the message
attach_max_bytes = 52428800

# Downloaded media is deleted after this long
blob_ttl = "10m"

# Where downloads are buffered (default: <cache dir>/tributary/blobs)
# blob_dir = "/tmp/tributary"

# Give up on a single media item after this long
timeout = "2m"

# Types the chat platform cannot show and that should be converted first
convertible_types = ["video/webm"]

# Conversion service endpoint (conversion is disabled when unset)
# converter_endpoint = "http://localhost:8080/convert"
converter_target = "video/mp4"

[delivery]
# Minimum spacing between any two outgoing platform calls
gateway_interval = "35ms"

# Minimum spacing between two messages to the same destination
direct_interval = "1s"
group_interval = "3s"
channel_interval = "3s"

# Retries after the platform asks us to slow down
max_retries = 3

[platform]
# Telegram bot token
token = ""
api_base = "https://api.telegram.org"

[controller]
# Users allowed to manage every feed
supervisors = []

[imageboard]
api_base = "https://a.4cdn.org"
media_base = "https://i.4cdn.org"
site_base = "https://boards.4chan.org"

[reddit]
api_base = "https://www.reddit.com"
user_agent = "tributary/0.1.0"
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config file at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::UserId;

    #[test]
    fn test_default_config_deserializes() {
        let content = Config::default_config_content();
        let config = Config::parse(&content).expect("Default config should be valid TOML");

        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(60));
        assert_eq!(config.delivery.gateway_interval, Duration::from_millis(35));
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.mediator.convertible_types, vec!["video/webm"]);
        assert!(config.mediator.converter_endpoint.is_none());
        assert_eq!(config.platform.api_base, "https://api.telegram.org");
    }

    #[test]
    fn test_partial_config() {
        let content = r##"
[delivery]
group_interval = "10s"

[controller]
supervisors = [42]
"##;
        let config = Config::parse(content).expect("Partial config should work");

        assert_eq!(config.delivery.group_interval, Duration::from_secs(10));
        assert_eq!(config.delivery.direct_interval, Duration::from_secs(1));
        assert_eq!(config.controller.supervisors, vec![UserId(42)]);
        assert_eq!(config.mediator.concurrency, 4);
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").expect("Empty config should work");
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(60));
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler]\npoll_interval = \"15s\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(15));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler]\nsweep_interval = \"0s\"\n").unwrap();

        match Config::load(Some(&path)) {
            Err(ConfigError::Invalid { reason, .. }) => {
                assert!(reason.contains("sweep_interval"))
            }
            other => panic!("expected invalid config, got {:?}", other.map(|_| ())),
        }

        let config = Config::parse("[scheduler]\npoll_interval = 0").unwrap();
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
