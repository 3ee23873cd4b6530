//! # transport
//!
//! **Command transport** sends open / close / trail commands to the EA
//! bridge over HTTP.
//!
//! ## EA bridge contract
//! The bridge accepts `POST /command/{open|close|trail}` with the
//! [`EaCommand`] JSON body and answers:
//! ```json
//! { "retcode": 10009, "order": 123456, "price": 1.10012, "comment": "Request completed" }
//! ```
//! retcode 10009 = `TRADE_RETCODE_DONE` (success). Anything else is a broker
//! rejection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EaConfig;
use crate::models::Side;

/// MT5 `TRADE_RETCODE_DONE`.
const RETCODE_DONE: u32 = 10009;

// ─── Commands ─────────────────────────────────────────────────────────────────

/// Everything this node can ask the EA to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum EaCommand {
    Open {
        account_id: String,
        position_id: Uuid,
        symbol: String,
        volume: f64,
        side: Side,
        /// Slippage-adjusted limit price.
        price: f64,
    },
    Close {
        account_id: String,
        position_id: Uuid,
        symbol: String,
        /// Lots to close; less than the position volume for partial closes.
        volume: f64,
        price: f64,
    },
    /// Mirror a stop trigger onto the terminal.
    Trail {
        account_id: String,
        position_id: Uuid,
        trigger_price: f64,
    },
}

impl EaCommand {
    pub fn position_id(&self) -> Uuid {
        match self {
            EaCommand::Open { position_id, .. }
            | EaCommand::Close { position_id, .. }
            | EaCommand::Trail { position_id, .. } => *position_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EaCommand::Open { .. } => "OPEN",
            EaCommand::Close { .. } => "CLOSE",
            EaCommand::Trail { .. } => "TRAIL",
        }
    }

    /// Bridge endpoint for this command.
    fn path(&self) -> &'static str {
        match self {
            EaCommand::Open { .. } => "/command/open",
            EaCommand::Close { .. } => "/command/close",
            EaCommand::Trail { .. } => "/command/trail",
        }
    }

    /// Price the command was issued at, used as the fill when the EA omits one.
    fn reference_price(&self) -> f64 {
        match self {
            EaCommand::Open { price, .. } | EaCommand::Close { price, .. } => *price,
            EaCommand::Trail { trigger_price, .. } => *trigger_price,
        }
    }
}

// ─── Ack / Error ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub success: bool,
    /// Broker ticket.
    pub order_id: Option<u64>,
    pub fill_price: Option<f64>,
    pub error: Option<String>,
}

impl CommandAck {
    pub fn filled(order_id: u64, fill_price: f64) -> Self {
        Self { success: true, order_id: Some(order_id), fill_price: Some(fill_price), error: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { success: false, order_id: None, fill_price: None, error: Some(message.into()) }
    }
}

/// Failures reaching the bridge at all. The `Display` text is what the retry
/// layer classifies, so keep the transient markers in it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: EA bridge unreachable: {0}")]
    Unreachable(String),

    #[error("timeout waiting for EA bridge")]
    Timeout,

    #[error("EA bridge HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("EA response parse error: {0}")]
    Protocol(String),
}

// ─── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, command: &EaCommand) -> Result<CommandAck, TransportError>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EaResponse {
    retcode: u32,
    order: Option<u64>,
    price: Option<f64>,
    comment: Option<String>,
}

pub struct HttpEaTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    mock_ticket: AtomicU64,
}

impl HttpEaTransport {
    pub fn new(client: reqwest::Client, config: &EaConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            mock_ticket: AtomicU64::new(900_000),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.base_url == "mock"
    }
}

#[async_trait]
impl CommandTransport for HttpEaTransport {
    async fn send(&self, command: &EaCommand) -> Result<CommandAck, TransportError> {
        if self.is_mock() {
            let ticket = self.mock_ticket.fetch_add(1, Ordering::Relaxed);
            info!(
                position_id = %command.position_id(),
                kind = command.kind(),
                ticket,
                "🎭 [TRANSPORT] MOCK mode — simulating EA success"
            );
            return Ok(CommandAck::filled(ticket, command.reference_price()));
        }

        let url = format!("{}{}", self.base_url, command.path());

        info!(
            position_id = %command.position_id(),
            kind = command.kind(),
            ea_url = %url,
            "🚀 [TRANSPORT] Sending command to EA"
        );

        // ── HTTP POST ─────────────────────────────────────────────────────────
        let response = self
            .client
            .post(&url)
            .json(command)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "EA bridge unreachable");
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Unreachable(e.to_string())
                }
            })?;

        // ── HTTP Status ───────────────────────────────────────────────────────
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(http_status = %status, body = %body, "EA bridge returned HTTP error");
            // Gateway errors mean the bridge itself is down, not a broker verdict.
            if matches!(status.as_u16(), 502..=504) {
                return Err(TransportError::Unreachable(format!("gateway HTTP {status}")));
            }
            return Err(TransportError::Http { status: status.as_u16(), body });
        }

        // ── Parse Response ────────────────────────────────────────────────────
        let ea: EaResponse = response.json().await.map_err(|e| {
            error!(error = %e, "EA response parse failed");
            TransportError::Protocol(e.to_string())
        })?;

        if ea.retcode != RETCODE_DONE {
            let msg = format!(
                "EA rejected: retcode={} comment={}",
                ea.retcode,
                ea.comment.as_deref().unwrap_or("unknown")
            );
            warn!("{msg}");
            return Ok(CommandAck::rejected(msg));
        }

        info!(ticket = ?ea.order, "✅ [TRANSPORT] EA accepted command");
        Ok(CommandAck {
            success: true,
            order_id: ea.order,
            fill_price: Some(ea.price.unwrap_or_else(|| command.reference_price())),
            error: None,
        })
    }
}

// ─── Test double ──────────────────────────────────────────────────────────────
