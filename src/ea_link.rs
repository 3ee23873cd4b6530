//! # ea_link: liveness of the EA bridges pushing to this node
//!
//! Every push from an EA (a heartbeat, or a tick carrying `accountId`)
//! refreshes that account's link. A link silent for longer than
//! `EA_CONNECTION_TIMEOUT_SECS` is offline, and new entries for the account
//! are refused until the EA is heard from again. Accounts that never pushed
//! anything are not gated.
//!
//! ```text
//!  POST /api/ea/heartbeat ─┐
//!  POST /api/ea/tick ──────┴─▶ record_contact ─▶ last_seen · latency · quality
//!                                                      │
//!  liveness monitor (every EA_HEARTBEAT_INTERVAL_SECS) ─┴─▶ sweep ─▶ EA_LINK_LOST
//! ```
//!
//! | Latency   | Quality     |
//! |-----------|-------------|
//! | < 50 ms   | `EXCELLENT` |
//! | < 100 ms  | `GOOD`      |
//! | otherwise | `POOR`      |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::state::EngineContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkQuality {
    Excellent,
    Good,
    Poor,
    /// No latency sample yet.
    Unknown,
}

impl LinkQuality {
    pub fn from_latency(latency_ms: Option<f64>) -> Self {
        match latency_ms {
            None => LinkQuality::Unknown,
            Some(ms) if ms < 50.0 => LinkQuality::Excellent,
            Some(ms) if ms < 100.0 => LinkQuality::Good,
            Some(_) => LinkQuality::Poor,
        }
    }
}

/// What an EA says about itself in its heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EaInfo {
    pub version: String,
    /// `MT4` or `MT5`.
    pub platform: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EaLink {
    pub account_id: String,
    pub ea_info: Option<EaInfo>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub quality: LinkQuality,
    pub message_count: u64,
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub accounts: usize,
    pub online: usize,
    pub offline: usize,
    pub avg_latency_ms: Option<f64>,
    pub messages: u64,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

pub struct EaLinkRegistry {
    timeout: Duration,
    links: RwLock<HashMap<String, EaLink>>,
}

impl EaLinkRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, links: RwLock::new(HashMap::new()) }
    }

    fn is_stale(&self, link: &EaLink, now: DateTime<Utc>) -> bool {
        // a clock running backwards is not silence
        now.signed_duration_since(link.last_seen)
            .to_std()
            .map(|silence| silence > self.timeout)
            .unwrap_or(false)
    }

    /// Refreshes `account_id`. Returns true when the link is new or was
    /// offline until now.
    pub async fn touch(
        &self,
        account_id: &str,
        latency_ms: Option<f64>,
        ea_info: Option<EaInfo>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut links = self.links.write().await;
        let Some(link) = links.get_mut(account_id) else {
            links.insert(
                account_id.to_string(),
                EaLink {
                    account_id: account_id.to_string(),
                    ea_info,
                    first_seen: now,
                    last_seen: now,
                    latency_ms,
                    quality: LinkQuality::from_latency(latency_ms),
                    message_count: 1,
                    online: true,
                },
            );
            return true;
        };

        let came_back = !link.online;
        link.last_seen = now;
        link.online = true;
        link.message_count += 1;
        if latency_ms.is_some() {
            link.latency_ms = latency_ms;
            link.quality = LinkQuality::from_latency(latency_ms);
        }
        if ea_info.is_some() {
            link.ea_info = ea_info;
        }
        came_back
    }

    /// Marks links silent past the timeout offline. Returns the ones that
    /// went offline on this sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<EaLink> {
        let mut links = self.links.write().await;
        let mut lost = Vec::new();
        for link in links.values_mut() {
            if link.online && self.is_stale(link, now) {
                link.online = false;
                lost.push(link.clone());
            }
        }
        lost
    }

    /// Gate applied before a new order goes to `account_id`'s EA.
    pub async fn ensure_live(&self, account_id: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        let links = self.links.read().await;
        match links.get(account_id) {
            Some(link) if self.is_stale(link, now) => Err(EngineError::EaOffline {
                account_id: account_id.to_string(),
                last_seen: link.last_seen,
            }),
            _ => Ok(()),
        }
    }

    pub async fn get(&self, account_id: &str, now: DateTime<Utc>) -> Option<EaLink> {
        let links = self.links.read().await;
        links.get(account_id).map(|l| self.current(l, now))
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<EaLink> {
        let links = self.links.read().await;
        let mut out: Vec<EaLink> = links.values().map(|l| self.current(l, now)).collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> LinkSummary {
        let links = self.snapshot(now).await;
        let online = links.iter().filter(|l| l.online).count();
        let latencies: Vec<f64> = links.iter().filter_map(|l| l.latency_ms).collect();
        LinkSummary {
            accounts: links.len(),
            online,
            offline: links.len() - online,
            avg_latency_ms: (!latencies.is_empty())
                .then(|| latencies.iter().sum::<f64>() / latencies.len() as f64),
            messages: links.iter().map(|l| l.message_count).sum(),
        }
    }

    /// The link with `online` reflecting `now`, not the last sweep.
    fn current(&self, link: &EaLink, now: DateTime<Utc>) -> EaLink {
        let mut link = link.clone();
        link.online = link.online && !self.is_stale(&link, now);
        link
    }
}

// ─── Context helpers ──────────────────────────────────────────────────────────

/// Records a push from `account_id` and announces the link if it just came up.
pub async fn record_contact(
    ctx: &EngineContext,
    account_id: &str,
    latency_ms: Option<f64>,
    ea_info: Option<EaInfo>,
) {
    if ctx.ea_links.touch(account_id, latency_ms, ea_info, Utc::now()).await {
        info!(account_id, latency_ms = ?latency_ms, "🔌 [EA] Link up");
        ctx.broadcast(&EngineEvent::EaLinkUp { account_id: account_id.to_string() });
    } else {
        debug!(account_id, latency_ms = ?latency_ms, "[EA] Contact");
    }
}

/// Sweeps the EA links every `heartbeat_interval` until the runtime stops.
pub fn spawn_liveness_monitor(ctx: Arc<EngineContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut every = tokio::time::interval(ctx.config.ea.heartbeat_interval);
        every.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = ctx.config.ea.heartbeat_interval.as_secs(),
            timeout_secs = ctx.config.ea.connection_timeout.as_secs(),
            "💓 [EA] Liveness monitor started"
        );

        loop {
            every.tick().await;
            for link in ctx.ea_links.sweep(Utc::now()).await {
                warn!(
                    account_id = %link.account_id,
                    last_seen = %link.last_seen,
                    "📵 [EA] Link lost, entries for this account are held"
                );
                ctx.broadcast(&EngineEvent::EaLinkLost {
                    account_id: link.account_id,
                    last_seen: link.last_seen,
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EaLinkRegistry {
        EaLinkRegistry::new(Duration::from_secs(300))
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(LinkQuality::from_latency(Some(12.0)), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_latency(Some(50.0)), LinkQuality::Good);
        assert_eq!(LinkQuality::from_latency(Some(100.0)), LinkQuality::Poor);
        assert_eq!(LinkQuality::from_latency(None), LinkQuality::Unknown);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_gated() {
        assert!(registry().ensure_live("acc-1", Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_silent_link_is_offline_until_heard_again() {
        let links = registry();
        let t0 = Utc::now();
        assert!(links.touch("acc-1", Some(20.0), None, t0).await);
        assert!(!links.touch("acc-1", None, None, t0).await);

        let later = t0 + chrono::Duration::seconds(301);
        assert!(matches!(
            links.ensure_live("acc-1", later).await,
            Err(EngineError::EaOffline { ref account_id, .. }) if account_id == "acc-1"
        ));

        let lost = links.sweep(later).await;
        assert_eq!(lost.len(), 1);
        assert!(links.sweep(later).await.is_empty());
        assert!(!links.get("acc-1", later).await.unwrap().online);

        // back again
        assert!(links.touch("acc-1", Some(120.0), None, later).await);
        assert!(links.ensure_live("acc-1", later).await.is_ok());
        let link = links.get("acc-1", later).await.unwrap();
        assert_eq!(link.quality, LinkQuality::Poor);
        assert_eq!(link.message_count, 3);
    }

    #[tokio::test]
    async fn test_summary_counts_links() {
        let links = registry();
        let now = Utc::now();
        links.touch("acc-1", Some(20.0), None, now - chrono::Duration::seconds(400)).await;
        links.touch("acc-2", Some(40.0), None, now).await;

        let s = links.summary(now).await;
        assert_eq!((s.accounts, s.online, s.offline, s.messages), (2, 1, 1, 2));
        assert_eq!(s.avg_latency_ms, Some(30.0));
    }
}
