//! SendLater configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SendLaterError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendLaterConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pages: PagesConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl SendLaterConfig {
    /// Load config from the default path (~/.sendlater/config.toml).
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
            .map_err(|e| SendLaterError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SendLaterError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SendLaterError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the SendLater home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sendlater")
    }
}

/// Scheduler core tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Re-arm offset, in seconds, for past-due messages found at startup.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Days a terminal record is kept before the sweep removes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Hours between retention sweeps in serve mode.
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,
}

fn default_grace_secs() -> u64 { 5 }
fn default_retention_days() -> u64 { 7 }
fn default_sweep_interval_hours() -> u64 { 24 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            retention_days: default_retention_days(),
            sweep_interval_hours: default_sweep_interval_hours(),
        }
    }
}

impl SchedulerConfig {
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 3600)
    }
}

/// Page acquisition tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagesConfig {
    /// URL pattern of the target application's pages.
    #[serde(default = "default_url_pattern")]
    pub url_pattern: String,
    /// Bound on waiting for a freshly opened page to finish navigating.
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
    /// Bound on waiting for a page's explicit readiness signal.
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    /// Settle delay after readiness for a freshly created page.
    #[serde(default = "default_settle_fresh_ms")]
    pub settle_fresh_ms: u64,
    /// Settle delay after readiness for an already-open page.
    #[serde(default = "default_settle_warm_ms")]
    pub settle_warm_ms: u64,
    /// Delay before closing a page that was opened solely for one
    /// delivery, counted from its successful delivery report.
    #[serde(default = "default_close_delay_secs")]
    pub close_delay_secs: u64,
}

fn default_url_pattern() -> String { "*://web.whatsapp.com/*".into() }
fn default_navigation_timeout_secs() -> u64 { 30 }
fn default_readiness_timeout_secs() -> u64 { 30 }
fn default_settle_fresh_ms() -> u64 { 3000 }
fn default_settle_warm_ms() -> u64 { 800 }
fn default_close_delay_secs() -> u64 { 10 }

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            url_pattern: default_url_pattern(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            settle_fresh_ms: default_settle_fresh_ms(),
            settle_warm_ms: default_settle_warm_ms(),
            close_delay_secs: default_close_delay_secs(),
        }
    }
}

impl PagesConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn settle_fresh(&self) -> Duration {
        Duration::from_millis(self.settle_fresh_ms)
    }

    pub fn settle_warm(&self) -> Duration {
        Duration::from_millis(self.settle_warm_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_secs(self.close_delay_secs)
    }
}

/// Delivery agent tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Wait before the first activation check after opening a chat.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Activation checks before giving up on a labeled conversation.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    /// Interval between activation checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_initial_delay_ms() -> u64 { 700 }
fn default_poll_attempts() -> u32 { 12 }
fn default_poll_interval_ms() -> u64 { 500 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory override; defaults to ~/.sendlater.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(SendLaterConfig::home_dir)
    }
}

/// Settings for the built-in simulated chat surface used by `serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Conversation titles seeded into the simulated surface.
    #[serde(default)]
    pub conversations: Vec<String>,
    /// Title of the conversation that starts frontmost.
    #[serde(default)]
    pub active: Option<String>,
    /// Open one page up-front, as if the app were already open.
    #[serde(default = "default_true")]
    pub preopen: bool,
}

fn default_true() -> bool { true }

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
            active: None,
            preopen: default_true(),
        }
    }
}
