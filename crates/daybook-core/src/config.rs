//! Daybook configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DaybookError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaybookConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub polish: PolishConfig,
}

impl DaybookConfig {
    /// Load config from the default path (~/.daybook/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaybookError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DaybookError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DaybookError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Daybook home directory (~/.daybook).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".daybook")
    }
}

/// Dispatch worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Max obligations processed concurrently within one tick.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Consecutive failures before an obligation is flagged for manual
    /// review and skipped.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// A claim older than this is treated as abandoned and reclaimable.
    /// Keep it at several multiples of the tick interval.
    #[serde(default = "default_lease_stale")]
    pub lease_stale_secs: u64,
    /// Build daily digests for the previous day during ticks.
    #[serde(default = "bool_true")]
    pub auto_digest: bool,
}

fn default_tick_interval() -> u64 {
    300
}
fn default_concurrency() -> usize {
    4
}
fn default_max_failures() -> u32 {
    5
}
fn default_lease_stale() -> u64 {
    1800
}
fn bool_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            concurrency: default_concurrency(),
            max_consecutive_failures: default_max_failures(),
            lease_stale_secs: default_lease_stale(),
            auto_digest: true,
        }
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.daybook/daybook.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Print vendor API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_vendor_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_secs: u64,
}

fn default_vendor_url() -> String {
    "https://api.printvendor.example/v1".into()
}
fn default_vendor_timeout() -> u64 {
    30
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: default_vendor_url(),
            api_key: String::new(),
            timeout_secs: default_vendor_timeout(),
        }
    }
}

/// Document render service (opaque; turns entries into print-ready PDFs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

fn default_render_url() -> String {
    "https://render.daybook.example/v1".into()
}
fn default_render_timeout() -> u64 {
    60
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_url: default_render_url(),
            api_key: String::new(),
            timeout_secs: default_render_timeout(),
        }
    }
}

/// Outbound SMTP for email reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from() -> String {
    "Daybook <reports@daybook.example>".into()
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: default_from(),
        }
    }
}

/// Chat-webhook delivery for reminder nudges.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// AI polish service (opaque text-in/text-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolishConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_polish_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_polish_timeout")]
    pub timeout_secs: u64,
}

fn default_polish_url() -> String {
    "https://polish.daybook.example/v1".into()
}
fn default_polish_timeout() -> u64 {
    20
}

impl Default for PolishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_polish_url(),
            api_key: String::new(),
            timeout_secs: default_polish_timeout(),
        }
    }
}
