//! Runtime configuration.
//!
//! Layered: `sparlo.toml` in the data directory (if present) provides the
//! base, `SPARLO_*` environment variables override it, and the CLI can
//! override individual fields on top. `.env` files are honored via dotenvy
//! before the environment is read.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Budget and rate-cap knobs consumed by the usage ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Per-account token allowance for one billing period.
    pub tier_limit_tokens: u64,
    /// Max reports an account may create inside the cooldown window.
    pub max_reports_per_window: u64,
    /// Cooldown window length in seconds.
    pub cooldown_window_secs: u64,
    /// Max reports an account may create per day.
    pub max_reports_per_day: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            tier_limit_tokens: 500_000,
            max_reports_per_window: 2,
            cooldown_window_secs: 300,
            max_reports_per_day: 10,
        }
    }
}

/// Backoff tuning for the step executor's single retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the database and log files.
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local UI development.
    pub dev_mode: bool,
    /// Concurrency bound for parallel phase execution, tuned to the model
    /// collaborator's rate limits.
    pub max_parallel: usize,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".sparlo"),
            host: "127.0.0.1".to_string(),
            port: 8710,
            dev_mode: false,
            max_parallel: 2,
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `sparlo.toml` under `data_dir`,
    /// then environment overrides.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Config {
            data_dir: data_dir.unwrap_or_else(|| PathBuf::from(".sparlo")),
            ..Config::default()
        };

        let toml_path = config.data_dir.join("sparlo.toml");
        if toml_path.exists() {
            config = Self::load_from_file(&toml_path, &config.data_dir)?;
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn load_from_file(path: &Path, data_dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        // The data dir that located the file wins over whatever the file says.
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("SPARLO_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("SPARLO_PORT") {
            self.port = port.parse().context("SPARLO_PORT must be a port number")?;
        }
        if let Ok(v) = std::env::var("SPARLO_MAX_PARALLEL") {
            self.max_parallel = v.parse().context("SPARLO_MAX_PARALLEL must be an integer")?;
        }
        if let Ok(v) = std::env::var("SPARLO_TIER_LIMIT_TOKENS") {
            self.budget.tier_limit_tokens =
                v.parse().context("SPARLO_TIER_LIMIT_TOKENS must be an integer")?;
        }
        if let Ok(v) = std::env::var("SPARLO_DEV_MODE") {
            self.dev_mode = v != "false" && v != "0";
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sparlo.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8710);
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.budget.cooldown_window_secs, 300);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sparlo.toml"),
            r#"
port = 9000
max_parallel = 4

[budget]
tier_limit_tokens = 1000000
max_reports_per_window = 3
cooldown_window_secs = 120
max_reports_per_day = 20
"#,
        )
        .unwrap();

        let config = Config::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.budget.tier_limit_tokens, 1_000_000);
        assert_eq!(config.budget.cooldown_window_secs, 120);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.retry.base_ms, 1_000);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sparlo.toml"), "host = \"0.0.0.0\"\n").unwrap();

        let config = Config::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8710);
        assert_eq!(config.budget.max_reports_per_day, 10);
    }

    #[test]
    fn test_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/sparlo-test"),
            ..Config::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/tmp/sparlo-test/sparlo.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/sparlo-test/logs"));
        assert_eq!(config.bind_addr(), "127.0.0.1:8710");
    }
}
