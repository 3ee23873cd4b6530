//! # config: node configuration from environment variables
//!
//! Everything is read once at startup (after `dotenvy`) and handed to the
//! [`EngineContext`](crate::state::EngineContext). Unset variables fall back
//! to the defaults below; only `HEDGE_USER_ID` is mandatory.

use std::time::Duration;

use anyhow::{bail, Context};

use crate::engine::entry::EntryConfig;
use crate::engine::retry::RetryPolicy;

// ─── EA bridge ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EaConfig {
    /// Base URL of the EA bridge. `"mock"` simulates fills locally.
    pub base_url: String,
    /// Per-command HTTP timeout.
    pub timeout: Duration,
    /// How often the liveness monitor sweeps the EA links.
    pub heartbeat_interval: Duration,
    /// Silence after which an account's EA counts as offline.
    pub connection_timeout: Duration,
}

impl Default for EaConfig {
    fn default() -> Self {
        Self {
            base_url: "mock".to_string(),
            timeout: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(300),
        }
    }
}

// ─── Force close ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ForceCloseConfig {
    /// Positions closed concurrently per batch.
    pub batch_size: usize,
    /// Pause between batches to bound burst load on the EA bridge.
    pub batch_pause: Duration,
}

impl Default for ForceCloseConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(10),
        }
    }
}

// ─── NodeConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// userId of this instance; only records with this ownerId are acted on.
    pub user_id: String,
    pub bind_addr: String,
    pub ea: EaConfig,
    pub entry: EntryConfig,
    /// Transport-level retry used by the entry and close engines.
    pub retry: RetryPolicy,
    /// Extra close attempts made by the executor after the transport-level
    /// budget is exhausted.
    pub supervisor_retries: u32,
    pub force_close: ForceCloseConfig,
    /// Execution records retained by the in-memory metrics sink.
    pub metrics_history: usize,
}

impl NodeConfig {
    /// Defaults for a given instance, no environment involved.
    pub fn for_instance(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            bind_addr: "0.0.0.0:3000".to_string(),
            ea: EaConfig::default(),
            entry: EntryConfig::default(),
            retry: RetryPolicy::default(),
            supervisor_retries: 3,
            force_close: ForceCloseConfig::default(),
            metrics_history: 500,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let user_id = std::env::var("HEDGE_USER_ID")
            .context("HEDGE_USER_ID environment variable is required")?;
        if user_id.trim().is_empty() {
            bail!("HEDGE_USER_ID must not be empty");
        }

        let retry_defaults = RetryPolicy::default();
        let entry_defaults = EntryConfig::default();

        Ok(Self {
            user_id,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            ea: EaConfig {
                base_url: std::env::var("EA_BASE_URL").unwrap_or_else(|_| "mock".to_string()),
                timeout: Duration::from_millis(env_u64("EA_TIMEOUT_MS", 5_000)),
                heartbeat_interval: Duration::from_secs(env_u64("EA_HEARTBEAT_INTERVAL_SECS", 30).max(1)),
                connection_timeout: Duration::from_secs(env_u64("EA_CONNECTION_TIMEOUT_SECS", 300)),
            },
            entry: EntryConfig {
                max_spread: env_f64("ENTRY_MAX_SPREAD", entry_defaults.max_spread),
                max_volatility: env_f64("ENTRY_MAX_VOLATILITY", entry_defaults.max_volatility),
                min_liquidity: env_f64("ENTRY_MIN_LIQUIDITY", entry_defaults.min_liquidity),
                ..entry_defaults
            },
            retry: RetryPolicy {
                max_attempts: env_u32("RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
                base_delay: Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS", 1_000)),
                max_delay: Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS", 5_000)),
            },
            supervisor_retries: env_u32("SUPERVISOR_MAX_RETRIES", 3),
            force_close: ForceCloseConfig {
                batch_size: env_u64("FORCE_CLOSE_BATCH_SIZE", 10).max(1) as usize,
                batch_pause: Duration::from_millis(env_u64("FORCE_CLOSE_BATCH_PAUSE_MS", 10)),
            },
            metrics_history: env_u64("METRICS_HISTORY", 500) as usize,
        })
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
