//! Configuration structures for topic-inspector.
//!
//! - [`SessionConfig`] - Consumption session settings (polling, batching, limits)
//! - [`StoreConfig`] - Filter store settings (persistence location)
//! - [`Config`] - Root configuration combining all settings
//!
//! All configuration types implement [`Default`], and every section is
//! `#[serde(default)]` so partial configuration files are accepted.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for consumption sessions.
///
/// # Examples
///
/// ```
/// use ti_core::SessionConfig;
///
/// let config = SessionConfig::default();
/// assert_eq!(config.poll_interval_ms, 1000);
/// assert_eq!(config.max_messages, Some(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between two fetches of a Live session, in milliseconds.
    pub poll_interval_ms: u64,

    /// Maximum number of records requested from the source per fetch.
    pub batch_size: usize,

    /// Maximum number of matching messages a Historical session emits.
    ///
    /// `None` reads until the historical bound.
    pub max_messages: Option<usize>,

    /// Batch size from which predicate evaluation runs on the rayon pool.
    pub parallel_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 100,
            max_messages: Some(100),
            parallel_threshold: 256,
        }
    }
}

impl SessionConfig {
    /// Returns the Live inter-poll delay as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration for the filter store.
///
/// # Examples
///
/// ```
/// use ti_core::StoreConfig;
///
/// assert_eq!(StoreConfig::default().path, "filters.json");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Location of the JSON document holding saved filters.
    pub path: Utf8PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Utf8PathBuf::from("filters.json"),
        }
    }
}

/// Root configuration for topic-inspector.
///
/// # Examples
///
/// ```
/// use ti_core::Config;
///
/// let config: Config = serde_json::from_str(r#"{"session": {"batch_size": 10}}"#)?;
/// assert_eq!(config.session.batch_size, 10);
/// assert_eq!(config.session.poll_interval_ms, 1000);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consumption session configuration.
    pub session: SessionConfig,

    /// Filter store configuration.
    pub store: StoreConfig,
}

impl Config {
    /// Loads and validates a configuration file in JSON format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] if the file does not exist,
    /// [`ConfigError::Parse`] if it is not valid JSON for this structure, and
    /// [`ConfigError::InvalidOption`] if a value fails validation.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_owned()));
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks option values that deserialize fine but cannot be used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_option(
                "session.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.session.batch_size == 0 {
            return Err(ConfigError::invalid_option(
                "session.batch_size",
                "must be greater than zero",
            ));
        }
        if self.session.max_messages == Some(0) {
            return Err(ConfigError::invalid_option(
                "session.max_messages",
                "must be greater than zero when set",
            ));
        }
        if self.store.path.as_str().is_empty() {
            return Err(ConfigError::invalid_option("store.path", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_messages, Some(100));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_deserialize_with_missing_fields() {
        let json = r#"{"store": {"path": "/var/lib/ti/filters.json"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.store.path, "/var/lib/ti/filters.json");
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.session.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.batch_size"));
    }

    #[test]
    fn test_validate_rejects_zero_page_limit() {
        let mut config = Config::default();
        config.session.max_messages = Some(0);
        assert!(config.validate().is_err());

        config.session.max_messages = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Utf8Path::new("/nonexistent/ti.json")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("ti.json")).unwrap();

        std::fs::write(&path, r#"{"session": {"poll_interval_ms": 250}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.session.poll_interval_ms, 250);

        std::fs::write(&path, r#"{"session": {"poll_interval_ms": 0}}"#).unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::InvalidOption { .. })
        ));
    }
}
