//! # error
//!
//! Two layers of errors:
//!
//! * [`EngineError`]: what the engines and the executor return. Every
//!   failure path ends in one of these; nothing panics across a component
//!   boundary.
//! * [`AppError`]: what HTTP handlers return. Axum's `IntoResponse` impl
//!   converts these into structured JSON bodies so the EA bridge / operator
//!   tooling always gets a machine-readable response even on failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PositionStatus;
use crate::store::StoreError;

// ─── EngineError ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input (non-positive volume, breached trigger, ...). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The broker rejected the order. Never retried.
    #[error("Execution rejected: {0}")]
    Execution(String),

    /// Transient failures hit the attempt cap.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Record {0} is not owned by this instance")]
    NotOwned(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Position {position_id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        position_id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
    },

    /// A command for this position is already dispatched; it cannot be
    /// withdrawn, only compensated.
    #[error("Position {0} already has a command in flight")]
    CommandInFlight(Uuid),

    #[error("No price available for {0}")]
    PriceUnavailable(String),

    /// The account's EA bridge has gone quiet; nothing new is dispatched to it.
    #[error("EA bridge for account {account_id} silent since {last_seen}")]
    EaOffline {
        account_id: String,
        last_seen: DateTime<Utc>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the supervisory loop is allowed to try again.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, EngineError::RetriesExhausted { .. })
    }

    /// Attempts consumed before this error surfaced (1 for non-retried errors).
    pub fn attempts(&self) -> u32 {
        match self {
            EngineError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

// ─── AppError ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The record exists but belongs to another instance.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request conflicts with the record's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// EA bridge command failed.
    #[error("Trade execution error: {0}")]
    ExecutionError(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => AppError::BadRequest(msg),
            EngineError::NotFound(msg) => AppError::NotFound(msg),
            EngineError::NotOwned(_) => AppError::Forbidden(err.to_string()),
            EngineError::InvalidTransition { .. } | EngineError::CommandInFlight(_) => {
                AppError::Conflict(err.to_string())
            }
            EngineError::Execution(_)
            | EngineError::RetriesExhausted { .. }
            | EngineError::PriceUnavailable(_)
            | EngineError::EaOffline { .. } => AppError::ExecutionError(err.to_string()),
            EngineError::Store(e) => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::ExecutionError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
