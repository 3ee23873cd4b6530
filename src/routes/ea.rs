//! # routes::ea
//!
//! Callbacks from the local **EA bridge**.
//!
//! ## Endpoints
//!
//! | Method | Path                  | Description                                   |
//! |--------|-----------------------|-----------------------------------------------|
//! | POST   | `/api/ea/tick`               | Price tick: update feed, evaluate trails |
//! | POST   | `/api/ea/stop-out`           | Broker stopped a position out            |
//! | POST   | `/api/ea/heartbeat`          | EA liveness ping with optional latency   |
//! | GET    | `/api/ea/health`             | Counters and EA links for the dashboard  |
//! | GET    | `/api/ea/links/:account_id`  | One account's link quality               |

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    ea_link::{record_contact, EaInfo},
    error::AppError,
    models::TickData,
    state::SharedState,
};

// ─── POST /api/ea/tick ────────────────────────────────────────────────────────

/// **Hot path.** The EA calls this on every price change.
///
/// Trail evaluation runs inline (a map lookup per trailed position); the
/// closes it triggers are spawned so the EA gets its answer straight away.
///
/// ### Request body (JSON)
/// ```json
/// { "symbol": "EURUSD", "bid": 1.09995, "ask": 1.10005, "time": "2025-01-01T12:00:00Z" }
/// ```
///
/// ### Response
/// `200 OK` with `{ "ok": true, "triggered": ["<position id>", ...] }`
pub async fn handle_tick(
    State(state): State<SharedState>,
    Json(tick): Json<TickData>,
) -> Result<impl IntoResponse, AppError> {
    if !(tick.bid > 0.0 && tick.ask >= tick.bid) {
        return Err(AppError::BadRequest(format!(
            "invalid quote for {}: bid {} ask {}",
            tick.symbol, tick.bid, tick.ask
        )));
    }

    if let Some(account_id) = &tick.account_id {
        record_contact(&state.ctx, account_id, None, None).await;
    }
    state.feed.record(&tick).await;
    let triggered = state.executor.evaluate_tick(&tick).await;

    for &position_id in &triggered {
        let executor = Arc::clone(&state.executor);
        tokio::spawn(async move { executor.handle_trail_trigger(position_id).await });
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "ok":        true,
            "symbol":    tick.symbol,
            "bid":       tick.bid,
            "ask":       tick.ask,
            "triggered": triggered,
        })),
    ))
}

// ─── POST /api/ea/stop-out ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutRequest {
    pub position_id: Uuid,
    pub exit_price: Option<f64>,
}

pub async fn handle_stop_out(
    State(state): State<SharedState>,
    Json(req): Json<StopOutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let position = state.executor.apply_stop_out(req.position_id, req.exit_price).await?;
    Ok(Json(json!({ "ok": true, "position": position })))
}

// ─── POST /api/ea/heartbeat ───────────────────────────────────────────────────

/// ### Request body (JSON)
/// ```json
/// { "accountId": "acc-1", "sentAt": "2025-01-01T12:00:00Z",
///   "eaInfo": { "version": "2.1", "platform": "MT5" } }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub account_id: String,
    /// When the EA sent the ping; gives the one-way latency.
    pub sent_at: Option<DateTime<Utc>>,
    pub ea_info: Option<EaInfo>,
}

pub async fn handle_heartbeat(
    State(state): State<SharedState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.account_id.trim().is_empty() {
        return Err(AppError::BadRequest("accountId must not be empty".into()));
    }
    let now = Utc::now();
    let latency_ms = req
        .sent_at
        .and_then(|sent| now.signed_duration_since(sent).to_std().ok())
        .map(|d| d.as_secs_f64() * 1_000.0);

    record_contact(&state.ctx, &req.account_id, latency_ms, req.ea_info).await;
    let link = state.ctx.ea_links.get(&req.account_id, now).await;

    Ok(Json(json!({
        "ok":          true,
        "type":        "HEARTBEAT_ACK",
        "server_time": now,
        "latency_ms":  latency_ms,
        "quality":     link.map(|l| l.quality),
    })))
}

// ─── GET /api/ea/health ───────────────────────────────────────────────────────

pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let now = Utc::now();
    Json(json!({
        "ok":             true,
        "user_id":        state.ctx.identity.user_id(),
        "tick_count":     state.ctx.ticks(),
        "trigger_count":  state.ctx.triggers(),
        "trailed":        state.executor.trailed_positions().await,
        "symbols":        state.feed.symbols().await,
        "ea_summary":     state.ctx.ea_links.summary(now).await,
        "ea_links":       state.ctx.ea_links.snapshot(now).await,
    }))
}

// ─── GET /api/ea/links/:account_id ────────────────────────────────────────────

pub async fn get_link(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let link = state
        .ctx
        .ea_links
        .get(&account_id, Utc::now())
        .await
        .ok_or_else(|| AppError::NotFound(format!("no EA link for account {account_id}")))?;
    Ok(Json(json!({ "ok": true, "link": link })))
}
