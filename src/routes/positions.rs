//! # routes::positions
//!
//! Operator endpoints. Every mutation goes through the executor, so the
//! ownership check and the status graph apply exactly as they do to
//! stream-driven work.
//!
//! ## Endpoints
//!
//! | Method | Path                                   | Description                          |
//! |--------|----------------------------------------|--------------------------------------|
//! | GET    | `/api/positions`                       | Owned positions (`?status=&symbol=`) |
//! | POST   | `/api/positions`                       | Create a PENDING position            |
//! | POST   | `/api/positions/:id/execute`           | PENDING → OPENING → OPEN             |
//! | POST   | `/api/positions/:id/close`             | OPEN → CLOSING → CLOSED              |
//! | POST   | `/api/positions/:id/partial-close`     | Reduce volume                        |
//! | POST   | `/api/positions/:id/cancel`            | Withdraw before dispatch             |
//! | POST   | `/api/positions/:id/stop-loss`         | Tighten the trail trigger            |
//! | POST   | `/api/positions/:id/profit-level`      | Volatility-scaled trail tightening   |
//! | POST   | `/api/positions/force-close`           | Close every owned OPEN position      |
//! | POST   | `/api/actions`                         | Create a PENDING action              |
//! | POST   | `/api/hedges`                          | Link two legs as a hedge pair        |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::AppError,
    hedge::link_hedge_pair,
    models::{Action, ActionType, ExecutionType, ExitReason, Position, PositionFilter, PositionStatus},
    state::SharedState,
};

// ─── Listing / creation ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<PositionStatus>,
    pub symbol: Option<String>,
}

pub async fn list_positions(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut filter = PositionFilter::owned_by(state.ctx.identity.user_id());
    if let Some(status) = query.status {
        filter = filter.with_status(status);
    }
    if let Some(symbol) = query.symbol {
        filter = filter.with_symbol(symbol);
    }

    let positions = state.ctx.store.list_positions(&filter).await.map_err(anyhow::Error::new)?;
    Ok(Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePositionRequest {
    /// Defaults to this instance.
    pub owner_id: Option<String>,
    pub account_id: String,
    pub symbol: String,
    pub volume: f64,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub trail_width: f64,
}

pub async fn create_position(
    State(state): State<SharedState>,
    Json(req): Json<CreatePositionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let owner = req.owner_id.unwrap_or_else(|| state.ctx.identity.user_id().to_string());
    let position = Position::new(owner, req.account_id, req.symbol, req.volume, req.execution_type, req.trail_width);
    position.validate()?;

    let position = state.ctx.store.create_position(position).await.map_err(anyhow::Error::new)?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "position": position }))))
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

pub async fn execute_position(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let position = state.executor.execute_entry(id).await?;
    Ok(Json(json!({ "ok": true, "position": position })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseRequest {
    pub reason: Option<ExitReason>,
}

pub async fn close_position(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CloseRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let reason = body.and_then(|Json(b)| b.reason).unwrap_or(ExitReason::Manual);
    let position = state.executor.execute_close(id, reason).await?;
    Ok(Json(json!({ "ok": true, "position": position })))
}

#[derive(Debug, Deserialize)]
pub struct PartialCloseRequest {
    pub volume: f64,
}

pub async fn partial_close_position(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PartialCloseRequest>,
) -> Result<impl IntoResponse, AppError> {
    let position = state
        .executor
        .execute_partial_close(id, req.volume, ExitReason::PartialClose)
        .await?;
    Ok(Json(json!({ "ok": true, "position": position })))
}

pub async fn cancel_position(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let position = state.executor.cancel_pending(id).await?;
    Ok(Json(json!({ "ok": true, "position": position })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossRequest {
    pub trigger_price: f64,
}

pub async fn update_stop_loss(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StopLossRequest>,
) -> Result<impl IntoResponse, AppError> {
    let trigger_price = state.executor.update_stop_loss(id, req.trigger_price).await?;
    Ok(Json(json!({ "ok": true, "position_id": id, "trigger_price": trigger_price })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitLevelRequest {
    /// Scales the position's trail width; below 1.0 tightens.
    pub width_multiplier: f64,
}

pub async fn adjust_profit_level(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProfitLevelRequest>,
) -> Result<impl IntoResponse, AppError> {
    let adjusted = state.executor.adjust_profit_level(id, req.width_multiplier).await?;
    Ok(Json(json!({
        "ok":            true,
        "position_id":   id,
        "adjusted":      adjusted.is_some(),
        "trigger_price": adjusted,
    })))
}

pub async fn force_close(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let report = state.executor.force_close_all(ExitReason::ForceClose).await?;
    Ok(Json(json!({
        "ok":     report.failed.is_empty(),
        "report": report,
    })))
}

// ─── Cross-instance records ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionRequest {
    pub owner_id: String,
    pub position_id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
}

pub async fn create_action(
    State(state): State<SharedState>,
    Json(req): Json<CreateActionRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.owner_id.trim().is_empty() {
        return Err(AppError::BadRequest("ownerId must not be empty".into()));
    }
    if req.action_type == ActionType::Unknown {
        return Err(AppError::BadRequest("type must be ENTRY or CLOSE".into()));
    }
    let action = Action::new(req.owner_id, req.position_id, req.action_type);
    let action = state.ctx.store.create_action(action).await.map_err(anyhow::Error::new)?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "action": action }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkHedgeRequest {
    pub position_a: Uuid,
    pub position_b: Uuid,
}

pub async fn link_hedge(
    State(state): State<SharedState>,
    Json(req): Json<LinkHedgeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let store = state.ctx.store.as_ref();
    let mut legs = Vec::with_capacity(2);
    for id in [req.position_a, req.position_b] {
        let leg = store
            .get_position(id)
            .await
            .map_err(anyhow::Error::new)?
            .ok_or_else(|| AppError::NotFound(format!("position {id}")))?;
        legs.push(leg);
    }

    let (a, b) = link_hedge_pair(store, &legs[0], &legs[1]).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "legs": [a, b] }))))
}
