//! Configuration loading, validation, and management for Coachflow.
//!
//! Loads configuration from `~/.coachflow/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use coachflow_core::{Sequence, WorkflowRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.coachflow/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Persistence backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Tick cadence, batching and concurrency
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// What happens after a send fails
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Outbound message provider
    #[serde(default)]
    pub sender: SenderConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Sequence definitions seeded into the store at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<Sequence>,

    /// Workflow rules seeded into the store at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<WorkflowRule>,
}

fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite database file (defaults to `<config_dir>/coachflow.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl StoreConfig {
    /// The database path, falling back to the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("coachflow.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Due enrollments fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Sends in flight at once within a tick
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Attempts at a compare-and-swap update before giving up for this tick
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Work not started by this point is left for the next tick
    #[serde(default = "default_tick_deadline")]
    pub tick_deadline_secs: u64,

    /// How long a claimed enrollment stays invisible to other ticks
    #[serde(default = "default_send_lease")]
    pub send_lease_secs: u64,

    /// Max users evaluated per inactivity rule per tick
    #[serde(default = "default_inactivity_batch")]
    pub inactivity_batch_size: usize,
}

fn default_tick_interval() -> u64 {
    60
}
fn default_page_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    8
}
fn default_send_timeout() -> u64 {
    30
}
fn default_conflict_retries() -> u32 {
    3
}
fn default_tick_deadline() -> u64 {
    50
}
fn default_send_lease() -> u64 {
    120
}
fn default_inactivity_batch() -> usize {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval(),
            page_size: default_page_size(),
            max_concurrency: default_max_concurrency(),
            send_timeout_secs: default_send_timeout(),
            conflict_retries: default_conflict_retries(),
            tick_deadline_secs: default_tick_deadline(),
            send_lease_secs: default_send_lease(),
            inactivity_batch_size: default_inactivity_batch(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_secs)
    }

    pub fn send_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.send_lease_secs as i64)
    }
}

/// Handling of a step whose send failed permanently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentFailurePolicy {
    /// Count the step as done for progression and flag the user for review.
    #[default]
    AdvanceAndFlag,
    /// Stay on the step, flag for review, and look again later.
    Freeze,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub on_permanent_failure: PermanentFailurePolicy,

    /// Tag written on the user when a send fails permanently
    #[serde(default = "default_review_tag")]
    pub review_tag: String,

    /// `freeze` only: how long until a frozen enrollment is due again
    #[serde(default = "default_freeze_recheck")]
    pub freeze_recheck_hours: u32,
}

fn default_review_tag() -> String {
    "needs_review".into()
}
fn default_freeze_recheck() -> u32 {
    24
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            on_permanent_failure: PermanentFailurePolicy::default(),
            review_tag: default_review_tag(),
            freeze_recheck_hours: default_freeze_recheck(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// "log" or "webhook"
    #[serde(default = "default_sender_kind")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Bearer token for the webhook provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// HMAC-SHA256 key for signing outbound payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

fn default_sender_kind() -> String {
    "log".into()
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: default_sender_kind(),
            webhook_url: None,
            api_key: None,
            signing_secret: None,
        }
    }
}

impl std::fmt::Debug for SenderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderConfig")
            .field("kind", &self.kind)
            .field("webhook_url", &self.webhook_url)
            .field("api_key", &redact(&self.api_key))
            .field("signing_secret", &redact(&self.signing_secret))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// When set, requests must carry a valid `X-Coachflow-Signature`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

fn default_port() -> u16 {
    42680
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            shared_secret: None,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("shared_secret", &redact(&self.shared_secret))
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.coachflow/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `COACHFLOW_DB_PATH`
    /// - `COACHFLOW_SENDER_URL`
    /// - `COACHFLOW_SENDER_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_path())
    }

    /// Load `path`, then apply the same environment overrides as [`AppConfig::load`].
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location inside [`AppConfig::config_dir`].
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("COACHFLOW_DB_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("COACHFLOW_SENDER_URL") {
            self.sender.webhook_url = Some(url);
        }
        if self.sender.api_key.is_none() {
            self.sender.api_key = std::env::var("COACHFLOW_SENDER_API_KEY").ok();
        }
    }

    /// Get the configuration directory path (`COACHFLOW_HOME` overrides).
    pub fn config_dir() -> PathBuf {
        match std::env::var("COACHFLOW_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs_home().join(".coachflow"),
        }
    }

    /// Validate the configuration.
    ///
    /// Seed entries are not checked here; each one is validated separately
    /// when loaded into the store so one bad entry cannot block the rest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown store backend '{other}' (expected sqlite or memory)"
                )));
            }
        }

        let s = &self.scheduler;
        if s.tick_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.tick_interval_secs must be > 0".into(),
            ));
        }
        if s.page_size == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.page_size must be > 0".into(),
            ));
        }
        if s.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_concurrency must be > 0".into(),
            ));
        }
        if s.send_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.send_timeout_secs must be > 0".into(),
            ));
        }
        if s.send_lease_secs < s.send_timeout_secs {
            return Err(ConfigError::ValidationError(
                "scheduler.send_lease_secs must be >= send_timeout_secs".into(),
            ));
        }

        if self.delivery.review_tag.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "delivery.review_tag cannot be empty".into(),
            ));
        }

        match self.sender.kind.as_str() {
            "log" => {}
            "webhook" => {
                if self.sender.webhook_url.is_none() {
                    return Err(ConfigError::ValidationError(
                        "sender.kind = \"webhook\" requires sender.webhook_url".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown sender kind '{other}' (expected log or webhook)"
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use coachflow_core::{Predicate, RuleAction, RuleTrigger};
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.store.backend, "sqlite");
        assert_eq!(config.scheduler.page_size, 100);
        assert_eq!(config.sender.kind, "log");
        assert_eq!(
            config.delivery.on_permanent_failure,
            PermanentFailurePolicy::AdvanceAndFlag
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.scheduler.send_lease_secs, 120);
    }

    #[test]
    fn zero_page_size_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_shorter_than_timeout_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.send_timeout_secs = 60;
        config.scheduler.send_lease_secs = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("send_lease_secs"));
    }

    #[test]
    fn webhook_sender_requires_url() {
        let mut config = AppConfig::default();
        config.sender.kind = "webhook".into();
        assert!(config.validate().is_err());
        config.sender.webhook_url = Some("https://mail.example.com/send".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.store.backend = "postgres".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.store.backend, "sqlite");
    }

    #[test]
    fn load_from_file_with_seeds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[store]
backend = "memory"

[delivery]
on_permanent_failure = "freeze"

[[sequences]]
id = "onboarding"
trigger_tag = "course:fm"
exit_tag = "purchased"

[[sequences.steps]]
position = 0
delay_minutes = 0
template_id = "welcome"

[[sequences.steps]]
position = 1
delay_minutes = 1440
template_id = "day-two"
channel = "direct_message"

[[rules]]
id = "inactive-nudge"
trigger = "inactive:72h"

[[rules.conditions]]
kind = "lacks_tag"
key = "nudged"

[[rules.actions]]
type = "send_message"
template_id = "we-miss-you"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.store.backend, "memory");
        assert_eq!(
            config.delivery.on_permanent_failure,
            PermanentFailurePolicy::Freeze
        );
        assert_eq!(config.sequences.len(), 1);
        assert_eq!(config.sequences[0].len(), 2);
        assert_eq!(config.sequences[0].trigger_tag.as_deref(), Some("course:fm"));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(
            config.rules[0].trigger,
            RuleTrigger::Inactivity { hours: 72 }
        );
        assert_eq!(config.rules[0].conditions[0], Predicate::lacks_tag("nudged"));
        assert!(matches!(
            config.rules[0].actions[0],
            RuleAction::SendMessage { .. }
        ));
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[scheduler\npage_size = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.sender.api_key = Some("sk-live-123".into());
        config.gateway.shared_secret = Some("hunter2".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-live-123"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[scheduler]"));
        assert!(toml_str.contains("advance_and_flag"));
        assert!(toml_str.contains("42680"));
    }
}
