//! # state
//!
//! [`EngineContext`] is built once at startup and handed to the executor
//! and, through [`AppState`], to every Axum handler. Nothing in the crate
//! reaches for a global.
//!
//! ```text
//!  EngineContext ─┬─ identity      (who am I)
//!                 ├─ store         Arc<dyn TradeStore>
//!                 ├─ transport     Arc<dyn CommandTransport>
//!                 ├─ price_feed    Arc<dyn PriceFeed>
//!                 ├─ metrics       Arc<dyn MetricsSink>
//!                 ├─ ea_links      last contact per EA account
//!                 └─ events_tx     broadcast::Sender<String>  ──▶ /ws/monitor
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::NodeConfig;
use crate::ea_link::EaLinkRegistry;
use crate::engine::executor::PositionExecutor;
use crate::events::EngineEvent;
use crate::metrics::{InMemoryMetrics, MetricsSink};
use crate::ownership::InstanceIdentity;
use crate::price_feed::{PriceFeed, TickPriceFeed};
use crate::store::TradeStore;
use crate::transport::CommandTransport;

/// Monitor channel depth; slow WebSocket clients past this just lag.
const EVENT_BROADCAST_CAPACITY: usize = 256;

// ─── EngineContext ────────────────────────────────────────────────────────────

pub struct EngineContext {
    pub identity: InstanceIdentity,
    pub config: NodeConfig,
    pub store: Arc<dyn TradeStore>,
    pub transport: Arc<dyn CommandTransport>,
    pub price_feed: Arc<dyn PriceFeed>,
    pub metrics: Arc<dyn MetricsSink>,
    pub ea_links: EaLinkRegistry,

    /// Pre-serialised [`EngineEvent`] JSON for the monitor.
    pub events_tx: broadcast::Sender<String>,

    pub tick_count: AtomicU64,
    pub trigger_count: AtomicU64,
}

impl EngineContext {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn TradeStore>,
        transport: Arc<dyn CommandTransport>,
        price_feed: Arc<dyn PriceFeed>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            identity: InstanceIdentity::new(config.user_id.clone()),
            ea_links: EaLinkRegistry::new(config.ea.connection_timeout),
            config,
            store,
            transport,
            price_feed,
            metrics,
            events_tx,
            tick_count: AtomicU64::new(0),
            trigger_count: AtomicU64::new(0),
        }
    }

    /// Never fails: no listener is a normal headless state.
    pub fn broadcast(&self, event: &EngineEvent) {
        let _ = self.events_tx.send(event.to_json());
    }

    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub fn triggers(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }
}

// ─── AppState ─────────────────────────────────────────────────────────────────

/// What the HTTP handlers see.
///
/// `feed` and `metrics` are the concrete collaborators behind the
/// context's trait objects; the tick route writes into the feed and the
/// monitor reads the metrics summary.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<EngineContext>,
    pub executor: Arc<PositionExecutor>,
    pub feed: Arc<TickPriceFeed>,
    pub metrics: Arc<InMemoryMetrics>,
}

pub type SharedState = Arc<AppState>;

/// Wires the in-process collaborators around `store` and `transport`.
pub fn build_state(
    config: NodeConfig,
    store: Arc<dyn TradeStore>,
    transport: Arc<dyn CommandTransport>,
) -> SharedState {
    let feed = Arc::new(TickPriceFeed::new());
    let metrics = Arc::new(InMemoryMetrics::new(config.metrics_history));
    let ctx = Arc::new(EngineContext::new(
        config,
        store,
        transport,
        feed.clone(),
        metrics.clone(),
    ));
    let executor = Arc::new(PositionExecutor::new(ctx.clone()));
    Arc::new(AppState { ctx, executor, feed, metrics })
}
