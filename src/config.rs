//! Daemon configuration.
//!
//! Loaded from a JSON file, then overridden from the environment:
//!
//! ```text
//! CONTENTSYNC_REPO_URL           repo_url
//! CONTENTSYNC_BRANCH             branch
//! CONTENTSYNC_MIRROR_DIR         mirror_dir
//! GH_TOKEN                       token
//! CONTENTSYNC_REVALIDATE_URL     revalidate_url
//! CONTENTSYNC_REVALIDATE_SECRET  revalidate_secret
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::RetryPolicy;
use crate::types::Locale;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote content repository (https or file URL).
    pub repo_url: String,
    pub branch: String,
    /// Local working copy of the content repository.
    pub mirror_dir: PathBuf,
    /// Access token for private repositories. Never logged.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub sync_interval_secs: u64,
    /// Hard upper bound on a single sync attempt.
    pub sync_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Run the first sync as soon as the scheduler registers.
    pub sync_on_start: bool,
    pub default_locale: Locale,
    /// Locales warmed after startup.
    pub locales: Vec<Locale>,
    pub revalidate_url: Option<String>,
    #[serde(skip_serializing)]
    pub revalidate_secret: Option<String>,
    /// SQLite audit log of sync attempts. Disabled when unset.
    pub history_db: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: "main".to_string(),
            mirror_dir: default_data_dir().join("mirror"),
            token: None,
            sync_interval_secs: 5 * 60,
            sync_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            sync_on_start: true,
            default_locale: Locale::default(),
            locales: vec![Locale::default()],
            revalidate_url: None,
            revalidate_secret: None,
            history_db: None,
        }
    }
}

/// `$XDG_CACHE_HOME/contentsync` or `.cache/contentsync` as a fallback.
fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("contentsync")
}

/// Default config file location: `$XDG_CONFIG_HOME/contentsync/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("contentsync")
        .join("config.json")
}

impl Config {
    /// Load configuration from `path` (or the default location), apply
    /// environment overrides, and validate.
    ///
    /// A missing file at the default location is not an error; a missing
    /// file that was asked for explicitly is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    log::debug!("No config file at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("CONTENTSYNC_REPO_URL") {
            self.repo_url = url;
        }
        if let Some(branch) = non_empty("CONTENTSYNC_BRANCH") {
            self.branch = branch;
        }
        if let Some(dir) = non_empty("CONTENTSYNC_MIRROR_DIR") {
            self.mirror_dir = PathBuf::from(dir);
        }
        if let Some(token) = non_empty("GH_TOKEN") {
            self.token = Some(token);
        }
        if let Some(url) = non_empty("CONTENTSYNC_REVALIDATE_URL") {
            self.revalidate_url = Some(url);
        }
        if let Some(secret) = non_empty("CONTENTSYNC_REVALIDATE_SECRET") {
            self.revalidate_secret = Some(secret);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "repo_url",
                "must be set (config file or CONTENTSYNC_REPO_URL)".to_string(),
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("branch", "cannot be empty".to_string()));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync_interval_secs",
                "must be greater than zero".to_string(),
            ));
        }
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync_timeout_secs",
                "must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts",
                "must be at least 1".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms",
                format!("must be >= backoff_base_ms ({})", self.backoff_base_ms),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    /// Locales to warm, always including the default locale.
    pub fn warm_locales(&self) -> Vec<Locale> {
        let mut locales = self.locales.clone();
        if !locales.contains(&self.default_locale) {
            locales.insert(0, self.default_locale.clone());
        }
        locales
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn valid() -> Config {
        Config {
            repo_url: "https://github.com/acme/directory-data.git".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.branch, "main");
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.default_locale.as_str(), "en");
        assert!(config.mirror_dir.ends_with("contentsync/mirror"));
    }

    #[test]
    fn default_config_requires_repo_url() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("repo_url", _)));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "repo_url": "file:///srv/content.git",
                "locales": ["en", "fr"],
                "sync_timeout_secs": 5
            }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.repo_url, "file:///srv/content.git");
        assert_eq!(config.sync_timeout_secs, 5);
        assert_eq!(config.branch, "main");
        assert_eq!(config.locales.len(), 2);
    }

    #[test]
    fn invalid_locale_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"locales": ["en", "../fr"]}"#).unwrap();

        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CONTENTSYNC_REPO_URL", "https://example.com/data.git"),
            ("CONTENTSYNC_BRANCH", "content"),
            ("GH_TOKEN", "ghp_secret"),
            ("CONTENTSYNC_REVALIDATE_URL", "  "),
        ]);

        let mut config = valid();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.repo_url, "https://example.com/data.git");
        assert_eq!(config.branch, "content");
        assert_eq!(config.token.as_deref(), Some("ghp_secret"));
        assert!(config.revalidate_url.is_none());
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = valid();
        config.token = Some("ghp_secret".to_string());
        config.revalidate_secret = Some("shh".to_string());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("ghp_secret"));
        assert!(!json.contains("shh"));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut config = valid();
        config.backoff_base_ms = 1_000;
        config.backoff_max_ms = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("backoff_max_ms", _))
        ));
    }

    #[test]
    fn warm_locales_include_default() {
        let mut config = valid();
        config.locales = vec!["fr".parse().unwrap()];
        let locales = config.warm_locales();
        assert_eq!(locales[0].as_str(), "en");
        assert_eq!(locales[1].as_str(), "fr");
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let policy = valid().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_millis(8_000));
    }
}
