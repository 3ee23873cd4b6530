//! # hedge-system — Position Execution & Cross-Instance Coordination
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  POST /api/ea/tick       ┌───────────────────────────┐
//!  │  EA bridge   │ ────────────────────────▶│  PositionExecutor         │
//!  │  (terminal)  │ ◀──── EaCommand ─────────│   entry · trail · action  │
//!  └──────────────┘                          └────────────┬──────────────┘
//!                                                         │ owns() filter
//!  ┌──────────────┐  Position / Action changes            │
//!  │ shared store │ ──────────────────────────────────────┘
//!  │ (all nodes)  │ ◀──── status writes, raised Actions
//!  └──────────────┘
//!                                            ┌──────────────┐
//!                       /ws/monitor ────────▶│  dashboard   │
//!                                            └──────────────┘
//! ```
//!
//! ## Environment Variables
//!
//! | Variable                     | Default         | Description                         |
//! |------------------------------|-----------------|-------------------------------------|
//! | `HEDGE_USER_ID`              | *(required)*    | Owner id this instance acts for     |
//! | `BIND_ADDR`                  | `0.0.0.0:3000`  | Address Axum listens on             |
//! | `EA_BASE_URL`                | `mock`          | EA bridge base URL                  |
//! | `EA_TIMEOUT_MS`              | `5000`          | Per-command timeout                 |
//! | `EA_HEARTBEAT_INTERVAL_SECS` | `30`            | EA liveness sweep interval          |
//! | `EA_CONNECTION_TIMEOUT_SECS` | `300`           | Silence before an EA is offline     |
//! | `RETRY_MAX_ATTEMPTS`         | `3`             | Transport attempts per command      |
//! | `RETRY_BASE_DELAY_MS`        | `1000`          | First backoff                       |
//! | `RETRY_MAX_DELAY_MS`         | `5000`          | Backoff ceiling                     |
//! | `SUPERVISOR_MAX_RETRIES`     | `3`             | Extra close rounds after exhaustion |
//! | `FORCE_CLOSE_BATCH_SIZE`     | `10`            | Concurrent closes per batch         |
//! | `FORCE_CLOSE_BATCH_PAUSE_MS` | `10`            | Pause between batches               |
//! | `RUST_LOG`                   | `hedge_system=debug` | Tracing filter                 |

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod ea_link;
mod engine;
mod error;
mod events;
mod hedge;
mod metrics;
mod models;
mod ownership;
mod price_feed;
mod routes;
mod state;
mod store;
mod transport;

use config::NodeConfig;
use state::build_state;
use store::InMemoryStore;
use transport::HttpEaTransport;

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional) ──────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("hedge_system=debug".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        HEDGE SYSTEM — Execution Node          ║
  ║        Entry · Trail · Action · Coordinate    ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration ─────────────────────────────────────────────────────
    let config = NodeConfig::from_env()?;
    let addr: SocketAddr = config.bind_addr.parse()?;
    info!(user_id = %config.user_id, ea = %config.ea.base_url, "⚙️ Node configured");

    // ── 4. Collaborators + shared state ──────────────────────────────────────
    let http_client = reqwest::Client::builder().timeout(config.ea.timeout).build()?;
    let transport = HttpEaTransport::new(http_client, &config.ea);
    if transport.is_mock() {
        warn!("🧪 EA_BASE_URL=mock — orders are simulated locally");
    }
    let state = build_state(config, Arc::new(InMemoryStore::new()), Arc::new(transport));

    // ── 5. Change-stream consumer + EA liveness sweep ────────────────────────
    tokio::spawn(state.executor.clone().run());
    ea_link::spawn_liveness_monitor(state.ctx.clone());

    // ── 6. Router ────────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // ── 7. Serve ─────────────────────────────────────────────────────────────
    info!(?addr, "🚀 hedge-system node starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
