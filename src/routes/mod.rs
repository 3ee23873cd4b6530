//! HTTP surface: EA bridge callbacks, operator endpoints and the monitor.

pub mod ea;
pub mod monitor;
pub mod positions;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

/// The full route table, without middleware.
pub fn router(state: SharedState) -> Router {
    Router::new()
        // ── EA bridge ────────────────────────────────────────────────────────
        .route("/api/ea/tick",                        post(ea::handle_tick))
        .route("/api/ea/stop-out",                    post(ea::handle_stop_out))
        .route("/api/ea/heartbeat",                   post(ea::handle_heartbeat))
        .route("/api/ea/health",                      get(ea::health_check))
        .route("/api/ea/links/:account_id",           get(ea::get_link))
        // ── Operator ─────────────────────────────────────────────────────────
        .route("/api/positions",                      get(positions::list_positions).post(positions::create_position))
        .route("/api/positions/force-close",          post(positions::force_close))
        .route("/api/positions/:id/execute",          post(positions::execute_position))
        .route("/api/positions/:id/close",            post(positions::close_position))
        .route("/api/positions/:id/partial-close",    post(positions::partial_close_position))
        .route("/api/positions/:id/cancel",           post(positions::cancel_position))
        .route("/api/positions/:id/stop-loss",        post(positions::update_stop_loss))
        .route("/api/positions/:id/profit-level",     post(positions::adjust_profit_level))
        .route("/api/actions",                        post(positions::create_action))
        .route("/api/hedges",                         post(positions::link_hedge))
        // ── Monitor ──────────────────────────────────────────────────────────
        .route("/api/monitor/stats",                  get(monitor::get_stats))
        .route("/ws/monitor",                         get(monitor::ws_monitor))
        .with_state(state)
}
