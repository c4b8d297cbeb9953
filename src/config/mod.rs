use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log destination used when `STORYLOOM_LOG` is set. Default: `storyloom.log`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    pub exchange: ExchangeConfig,
}

/// Tuning for the generation exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Retries allowed for transient failures when a task sets none. Default: 5.
    pub max_retries: u32,
    /// Backoff base; retry `n` waits `2^n` times this. Default: 1000.
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay. Default: 60000.
    pub max_retry_delay_ms: u64,
    /// Interval between budget countdown updates. Default: 1000.
    pub countdown_tick_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            countdown_tick_ms: 1000,
        }
    }
}

impl ExchangeConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Countdown tick, never zero.
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms.max(1))
    }
}

impl Config {
    /// Default config file location (`<config dir>/storyloom/config.toml`).
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("storyloom").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".storyloom/config.toml"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("storyloom.log"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from a specific file, falling back to defaults when it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.exchange, ExchangeConfig::default());
        assert_eq!(config.log_file(), PathBuf::from("storyloom.log"));
    }

    #[test]
    fn test_partial_exchange_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[exchange]\nmax_retries = 2\ncountdown_tick_ms = 250").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.exchange.max_retries, 2);
        assert_eq!(config.exchange.countdown_tick(), Duration::from_millis(250));
        assert_eq!(config.exchange.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.exchange.max_retry_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[exchange\nmax_retries = ").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let config = ExchangeConfig {
            countdown_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.countdown_tick(), Duration::from_millis(1));
    }
}
