//! Configuration loading for biztools.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `BIZTOOLS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `BIZTOOLS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_name")]
    pub log_name: String,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(default)]
    pub slack: SlackSettings,
    #[serde(default)]
    pub google: GoogleSettings,
    #[serde(default)]
    pub share: ShareConfig,
}

/// SQL Server settings (`BIZTOOLS_DB_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DatabaseSettings {
    #[serde(default = "default_db_driver")]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub trust_server_certificate: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            driver: default_db_driver(),
            server: None,
            database: None,
            user: None,
            password: None,
            max_connections: default_db_max_connections(),
            acquire_timeout_ms: default_db_acquire_timeout_ms(),
            trust_server_certificate: true,
        }
    }
}

/// Azure Communication Services Email settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EmailSettings {
    /// `endpoint=https://...;accesskey=...`
    ///
    /// Environment variable: `BIZTOOLS_EMAIL_CONNECTION_STRING`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default = "default_email_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            connection_string: None,
            poll_interval_ms: default_email_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SlackSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(default = "default_slack_api_base_url")]
    pub api_base_url: String,
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base_url: default_slack_api_base_url(),
        }
    }
}

/// Google Drive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GoogleSettings {
    /// Path to the service account JSON key
    ///
    /// Environment variable: `BIZTOOLS_SERVICE_ACCOUNT_FILE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_file: Option<PathBuf>,
    #[serde(default = "default_google_api_base")]
    pub api_base: String,
    /// Environment variable: `BIZTOOLS_GOOGLE_SCOPES` (comma-separated)
    #[serde(default = "default_google_scopes")]
    pub scopes: Vec<String>,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            service_account_file: None,
            api_base: default_google_api_base(),
            scopes: default_google_scopes(),
        }
    }
}

/// Recursive sharing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ShareConfig {
    /// Create calls per (node, identity); 1 disables retry (default: 1)
    ///
    /// Environment variable: `BIZTOOLS_SHARE_GRANT_ATTEMPTS`
    #[serde(default = "default_share_grant_attempts")]
    pub grant_attempts: u32,

    /// Base retry interval in milliseconds (default: 500)
    ///
    /// Subsequent retries use exponential backoff: base * 2^attempts.
    #[serde(default = "default_share_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Upper bound for the backoff in milliseconds (default: 30000)
    #[serde(default = "default_share_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Longest vendor `Retry-After` hint honoured, in milliseconds (default: 300000)
    #[serde(default = "default_share_retry_after_cap_ms")]
    pub retry_after_cap_ms: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    #[serde(default = "default_share_retry_jitter_factor")]
    pub retry_jitter_factor: f64,

    /// Skip identities that already hold a permission (default: false)
    #[serde(default)]
    pub skip_existing: bool,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            grant_attempts: default_share_grant_attempts(),
            retry_base_ms: default_share_retry_base_ms(),
            retry_max_ms: default_share_retry_max_ms(),
            retry_after_cap_ms: default_share_retry_after_cap_ms(),
            retry_jitter_factor: default_share_retry_jitter_factor(),
            skip_existing: false,
        }
    }
}

impl ShareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grant_attempts == 0 || self.grant_attempts > 10 {
            return Err(ConfigError::InvalidShareGrantAttempts {
                value: self.grant_attempts,
            });
        }

        if self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::InvalidShareRetryBounds {
                base: self.retry_base_ms,
                max: self.retry_max_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(ConfigError::InvalidShareRetryJitter {
                value: self.retry_jitter_factor,
            });
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_dir: default_log_dir(),
            log_name: default_log_name(),
            database: DatabaseSettings::default(),
            email: EmailSettings::default(),
            slack: SlackSettings::default(),
            google: GoogleSettings::default(),
            share: ShareConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.database.password.is_some() {
            config.database.password = Some("[REDACTED]".to_string());
        }
        if config.email.connection_string.is_some() {
            config.email.connection_string = Some("[REDACTED]".to_string());
        }
        if config.slack.bot_token.is_some() {
            config.slack.bot_token = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.log_name.trim().is_empty() {
            return Err(ConfigError::EmptyLogName);
        }

        if self.database.max_connections == 0 || self.database.max_connections > 100 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.database.max_connections,
            });
        }

        if self.email.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidEmailPollInterval {
                value: self.email.poll_interval_ms,
            });
        }

        self.share.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_name() -> String {
    "biztools".to_string()
}

fn default_db_driver() -> String {
    "ODBC Driver 18 for SQL Server".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_email_poll_interval_ms() -> u64 {
    1000
}

fn default_slack_api_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_google_api_base() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_google_scopes() -> Vec<String> {
    vec![crate::auth::DRIVE_SCOPE.to_string()]
}

fn default_share_grant_attempts() -> u32 {
    1 // no retry
}

fn default_share_retry_base_ms() -> u64 {
    500
}

fn default_share_retry_max_ms() -> u64 {
    30_000
}

fn default_share_retry_after_cap_ms() -> u64 {
    300_000
}

fn default_share_retry_jitter_factor() -> f64 {
    0.1
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value for BIZTOOLS_{key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("log name cannot be empty")]
    EmptyLogName,
    #[error("database max connections must be between 1 and 100, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("email poll interval must be positive, got {value}")]
    InvalidEmailPollInterval { value: u64 },
    #[error("share grant attempts must be between 1 and 10, got {value}")]
    InvalidShareGrantAttempts { value: u32 },
    #[error("share retry base ({base}ms) cannot be greater than max ({max}ms)")]
    InvalidShareRetryBounds { base: u64, max: u64 },
    #[error("share retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidShareRetryJitter { value: f64 },
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("BIZTOOLS_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(default_log_format);
        let log_dir = layered
            .remove("LOG_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);
        let log_name = layered
            .remove("LOG_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_name);

        let database = DatabaseSettings {
            driver: layered
                .remove("DB_DRIVER")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_db_driver),
            server: non_empty(layered.remove("DB_SERVER")),
            database: non_empty(layered.remove("DB_DATABASE")),
            user: non_empty(layered.remove("DB_USER")),
            password: layered.remove("DB_PASS").filter(|v| !v.is_empty()),
            max_connections: layered
                .remove("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_db_max_connections),
            acquire_timeout_ms: layered
                .remove("DB_ACQUIRE_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_db_acquire_timeout_ms),
            trust_server_certificate: match layered.remove("DB_TRUST_SERVER_CERTIFICATE") {
                Some(v) => parse_bool("DB_TRUST_SERVER_CERTIFICATE", &v)?,
                None => true,
            },
        };

        let email = EmailSettings {
            connection_string: non_empty(layered.remove("EMAIL_CONNECTION_STRING")),
            poll_interval_ms: layered
                .remove("EMAIL_POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_email_poll_interval_ms),
        };

        let slack = SlackSettings {
            bot_token: non_empty(layered.remove("SLACK_BOT_TOKEN")),
            api_base_url: layered
                .remove("SLACK_API_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_slack_api_base_url),
        };

        let google = GoogleSettings {
            service_account_file: non_empty(layered.remove("SERVICE_ACCOUNT_FILE"))
                .map(PathBuf::from),
            api_base: layered
                .remove("GOOGLE_API_BASE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_google_api_base),
            scopes: layered
                .remove("GOOGLE_SCOPES")
                .map(|v| split_list(&v))
                .filter(|scopes| !scopes.is_empty())
                .unwrap_or_else(default_google_scopes),
        };

        let share = ShareConfig {
            grant_attempts: layered
                .remove("SHARE_GRANT_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_share_grant_attempts),
            retry_base_ms: layered
                .remove("SHARE_RETRY_BASE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_share_retry_base_ms),
            retry_max_ms: layered
                .remove("SHARE_RETRY_MAX_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_share_retry_max_ms),
            retry_after_cap_ms: layered
                .remove("SHARE_RETRY_AFTER_CAP_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_share_retry_after_cap_ms),
            retry_jitter_factor: layered
                .remove("SHARE_RETRY_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_share_retry_jitter_factor),
            skip_existing: match layered.remove("SHARE_SKIP_EXISTING") {
                Some(v) => parse_bool("SHARE_SKIP_EXISTING", &v)?,
                None => false,
            },
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            log_dir,
            log_name,
            database,
            email,
            slack,
            google,
            share,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("BIZTOOLS_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("BIZTOOLS_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.share.grant_attempts, 1);
        assert!(!config.share.skip_existing);
        assert_eq!(config.google.scopes, vec![crate::auth::DRIVE_SCOPE.to_string()]);
    }

    #[test]
    fn test_share_config_validation() {
        let mut share = ShareConfig::default();
        share.grant_attempts = 0;
        assert!(matches!(
            share.validate(),
            Err(ConfigError::InvalidShareGrantAttempts { value: 0 })
        ));

        let mut share = ShareConfig::default();
        share.retry_base_ms = 5_000;
        share.retry_max_ms = 1_000;
        assert!(share.validate().is_err());

        let mut share = ShareConfig::default();
        share.retry_jitter_factor = 1.5;
        assert!(share.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = AppConfig::default();
        config.log_format = "xml".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogFormat { .. })
        ));
    }

    #[test]
    fn test_redacted_json_masks_secrets() {
        let mut config = AppConfig::default();
        config.database.password = Some("hunter2".to_string());
        config.slack.bot_token = Some("xoxb-secret".to_string());
        config.email.connection_string =
            Some("endpoint=https://x/;accesskey=c2VjcmV0".to_string());

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("xoxb-secret"));
        assert!(!json.contains("c2VjcmV0"));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
