//! Nexus configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NexusError, Result};
use crate::types::SmtpSettings;

/// Extra room on top of the worst-case batch duration before a claim counts as stuck.
const STUCK_SLACK_SECS: u64 = 60;

/// Upper bound for any configured wait (stuck threshold, retry tier delay).
pub const MAX_WAIT_SECS: u64 = 30 * 24 * 3600;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Fallback SMTP settings for owners without their own row.
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

impl NexusConfig {
    /// Load config from the default path (~/.nexus/config.toml).
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
            .map_err(|e| NexusError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NexusError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NexusError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nexus home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nexus")
    }

    /// Reject settings the scheduler cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.batch_size == 0 {
            return Err(NexusError::Config("dispatch.batch_size must be at least 1".into()));
        }
        if self.dispatch.tick_interval_secs == 0 {
            return Err(NexusError::Config(
                "dispatch.tick_interval_secs must be at least 1".into(),
            ));
        }
        if self.sender.pool_size == 0 {
            return Err(NexusError::Config("sender.pool_size must be at least 1".into()));
        }
        if self.sender.reconnect_every == 0 {
            return Err(NexusError::Config("sender.reconnect_every must be at least 1".into()));
        }
        self.rate_limit.validate()?;

        if self.dispatch.stuck_threshold_secs > MAX_WAIT_SECS {
            return Err(NexusError::Config(format!(
                "dispatch.stuck_threshold_secs must be at most {MAX_WAIT_SECS}"
            )));
        }
        let floor = self
            .max_batch_duration()
            .and_then(|d| d.checked_add(Duration::from_secs(STUCK_SLACK_SECS)))
            .ok_or_else(|| {
                NexusError::Config(
                    "sender.inter_item_delay_ms × dispatch.batch_size is out of range".into(),
                )
            })?;
        if self.dispatch.stuck_threshold() <= floor {
            return Err(NexusError::Config(format!(
                "dispatch.stuck_threshold_secs ({}) must exceed the worst-case batch duration plus slack ({}s)",
                self.dispatch.stuck_threshold_secs,
                floor.as_secs()
            )));
        }
        Ok(())
    }

    /// `B × inter-item delay` plus an open and a reopen. `None` on overflow.
    pub fn max_batch_duration(&self) -> Option<Duration> {
        let batch_size = u32::try_from(self.dispatch.batch_size).ok()?;
        let pacing = self.sender.inter_item_delay().checked_mul(batch_size)?;
        pacing.checked_add(self.sender.connect_timeout().checked_mul(2)?)
    }
}

/// Record store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.nexus/nexus.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scheduler tick settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Maximum items per batch (B).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum items claimed in one tick across all owners.
    #[serde(default = "default_dispatch_limit")]
    pub dispatch_limit: usize,
    /// Age after which a claimed, unfinished item is returned to `pending`.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
}

fn default_tick_interval() -> u64 { 10 }
fn default_batch_size() -> usize { 50 }
fn default_dispatch_limit() -> usize { 1000 }
fn default_stuck_threshold() -> u64 { 1800 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            batch_size: default_batch_size(),
            dispatch_limit: default_dispatch_limit(),
            stuck_threshold_secs: default_stuck_threshold(),
        }
    }
}

impl DispatchConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

/// Batch sender and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Pause between consecutive sends on one connection.
    #[serde(default = "default_inter_item_delay")]
    pub inter_item_delay_ms: u64,
    /// Concurrent batches.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Sends per connection before it is closed and reopened (K).
    #[serde(default = "default_reconnect_every")]
    pub reconnect_every: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_inter_item_delay() -> u64 { 5000 }
fn default_pool_size() -> usize { 4 }
fn default_reconnect_every() -> usize { 300 }
fn default_connect_timeout() -> u64 { 10 }

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            inter_item_delay_ms: default_inter_item_delay(),
            pool_size: default_pool_size(),
            reconnect_every: default_reconnect_every(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl SenderConfig {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// One row of the failure-tier table: from `min_failures` consecutive
/// rejections onward, wait `delay_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    pub min_failures: u32,
    pub delay_secs: u64,
}

/// Retry tiers for provider throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierRule>,
}

fn default_tiers() -> Vec<TierRule> {
    vec![
        TierRule { min_failures: 1, delay_secs: 30 },
        TierRule { min_failures: 3, delay_secs: 60 },
        TierRule { min_failures: 6, delay_secs: 3600 },
    ]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

impl RateLimitConfig {
    /// Tiers must start at or below one failure, be strictly ordered by
    /// `min_failures`, and never shorten the delay as failures grow.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .tiers
            .first()
            .ok_or_else(|| NexusError::Config("rate_limit.tiers must not be empty".into()))?;
        if first.min_failures > 1 {
            return Err(NexusError::Config(
                "rate_limit.tiers must cover the first failure (min_failures <= 1)".into(),
            ));
        }
        if let Some(tier) = self.tiers.iter().find(|t| t.delay_secs > MAX_WAIT_SECS) {
            return Err(NexusError::Config(format!(
                "rate_limit.tiers delay at min_failures = {} exceeds {MAX_WAIT_SECS}s",
                tier.min_failures
            )));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].min_failures <= pair[0].min_failures {
                return Err(NexusError::Config(
                    "rate_limit.tiers must be sorted by increasing min_failures".into(),
                ));
            }
            if pair[1].delay_secs < pair[0].delay_secs {
                return Err(NexusError::Config(format!(
                    "rate_limit.tiers delay decreases at min_failures = {}",
                    pair[1].min_failures
                )));
            }
        }
        Ok(())
    }
}
