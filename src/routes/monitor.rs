//! # routes::monitor
//!
//! **Monitor** endpoints for the dashboard.
//!
//! ## Endpoints
//!
//! | Method    | Path                 | Description                                |
//! |-----------|----------------------|--------------------------------------------|
//! | GET (WS)  | `/ws/monitor`        | Live [`EngineEvent`](crate::events::EngineEvent) stream |
//! | GET       | `/api/monitor/stats` | Counters, open positions, execution summary |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::{
    error::AppError,
    models::{PositionFilter, PositionStatus},
    state::SharedState,
};

/// How many recent execution records the stats endpoint returns.
const RECENT_EXECUTIONS: usize = 20;

// ─── WebSocket Handler ────────────────────────────────────────────────────────

pub async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.ctx.events_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 Monitor client connected");

    let snapshot = json!({
        "event":         "SNAPSHOT",
        "user_id":       state.ctx.identity.user_id(),
        "tick_count":    state.ctx.ticks(),
        "trigger_count": state.ctx.triggers(),
        "trailed":       state.executor.trailed_positions().await,
        "executions":    state.metrics.summary().await,
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("monitor client lagged, skipped {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 Monitor client disconnected");
}

// ─── GET /api/monitor/stats ───────────────────────────────────────────────────

pub async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let open_filter = PositionFilter::owned_by(state.ctx.identity.user_id()).with_status(PositionStatus::Open);
    let open_positions = state
        .ctx
        .store
        .list_positions(&open_filter)
        .await
        .map_err(anyhow::Error::new)?
        .len();

    Ok(Json(json!({
        "ok":             true,
        "user_id":        state.ctx.identity.user_id(),
        "tick_count":     state.ctx.ticks(),
        "trigger_count":  state.ctx.triggers(),
        "open_positions": open_positions,
        "trailed":        state.executor.trailed_positions().await,
        "executions":     state.metrics.summary().await,
        "recent":         state.metrics.recent(RECENT_EXECUTIONS).await,
    })))
}
