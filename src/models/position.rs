//! # models::position
//!
//! Defines [`Position`], the tradable unit owned by exactly one instance,
//! together with its status machine.
//!
//! ```text
//! PENDING ──▶ OPENING ──▶ OPEN ──▶ CLOSING ──▶ CLOSED
//!    │           │          │         │  │
//!    └──▶ CANCELED ◀────────┼─────────┘  └──▶ OPEN   (rollback)
//!                           └──▶ STOPPED             (broker stop-out)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

// ─── ExecutionType / Side ─────────────────────────────────────────────────────

/// Whether the position is an entry (long) or exit (short) leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Entry,
    Exit,
}

impl ExecutionType {
    /// ENTRY legs are bought, EXIT legs are sold.
    #[inline]
    pub fn side(self) -> Side {
        match self {
            ExecutionType::Entry => Side::Buy,
            ExecutionType::Exit => Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

// ─── PositionStatus ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Created by an operator or hedge logic, waiting for an execution request.
    Pending,
    /// Open command is being sent to the EA.
    Opening,
    /// Filled and live on the broker.
    Open,
    /// Close command is being sent to the EA.
    Closing,
    Closed,
    /// Closed by the broker (stop-out), never went through CLOSING.
    Stopped,
    Canceled,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PositionStatus::Closed | PositionStatus::Stopped | PositionStatus::Canceled
        )
    }

    /// Edges of the status graph. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Pending, Opening)
                | (Pending, Canceled)
                | (Opening, Open)
                | (Opening, Canceled)
                | (Open, Closing)
                | (Open, Stopped)
                | (Closing, Closed)
                | (Closing, Open)
                | (Closing, Canceled)
        )
    }
}

// ─── ExitReason ───────────────────────────────────────────────────────────────

/// Why a position left the market (or never entered it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TrailStop,
    Manual,
    ForceClose,
    PartialClose,
    /// Closed because another instance raised a CLOSE action for it.
    ActionTriggered,
    StopOut,
    EntryRejected,
    Withdrawn,
    /// Close retries exhausted; needs manual reconciliation with the broker.
    Unresolved,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TrailStop => "TRAIL_STOP",
            ExitReason::Manual => "MANUAL",
            ExitReason::ForceClose => "FORCE_CLOSE",
            ExitReason::PartialClose => "PARTIAL_CLOSE",
            ExitReason::ActionTriggered => "ACTION_TRIGGERED",
            ExitReason::StopOut => "STOP_OUT",
            ExitReason::EntryRejected => "ENTRY_REJECTED",
            ExitReason::Withdrawn => "WITHDRAWN",
            ExitReason::Unresolved => "UNRESOLVED",
        };
        f.write_str(s)
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    /// userId of the instance allowed to mutate this record.
    pub owner_id: String,
    pub account_id: String,
    pub symbol: String,
    /// Lots, e.g. `0.10`.
    pub volume: f64,
    pub execution_type: ExecutionType,
    pub status: PositionStatus,
    pub entry_price: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Trailing distance in price units; `0.0` disables trailing.
    #[serde(default)]
    pub trail_width: f64,
    /// Actions raised (in order) when this position closes.
    #[serde(default)]
    pub trigger_action_ids: Vec<Uuid>,
    pub broker_ticket: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(
        owner_id: impl Into<String>,
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        volume: f64,
        execution_type: ExecutionType,
        trail_width: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            account_id: account_id.into(),
            symbol: symbol.into(),
            volume,
            execution_type,
            status: PositionStatus::Pending,
            entry_price: None,
            entry_time: None,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            trail_width,
            trigger_action_ids: Vec::new(),
            broker_ticket: None,
            updated_at: Utc::now(),
        }
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.execution_type.side()
    }

    #[inline]
    pub fn has_trail(&self) -> bool {
        self.trail_width > 0.0
    }

    /// Input checks shared by creation paths: positive volume, non-negative
    /// trail width, non-empty owner.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.owner_id.trim().is_empty() {
            return Err(EngineError::Validation("ownerId must not be empty".into()));
        }
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Validation("symbol must not be empty".into()));
        }
        if !(self.volume > 0.0) {
            return Err(EngineError::Validation(format!(
                "volume must be positive, got {}",
                self.volume
            )));
        }
        if !(self.trail_width >= 0.0) {
            return Err(EngineError::Validation(format!(
                "trailWidth must not be negative, got {}",
                self.trail_width
            )));
        }
        Ok(())
    }

    /// Returns a copy moved to `next`, or `InvalidTransition` if the edge is
    /// not in the graph.
    pub fn transition(&self, next: PositionStatus) -> Result<Position, EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                position_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let mut moved = self.clone();
        moved.status = next;
        Ok(moved)
    }

    /// Unrealised (or realised, given the exit price) profit in price units × lots.
    pub fn profit_at(&self, price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        let diff = match self.side() {
            Side::Buy => price - entry,
            Side::Sell => entry - price,
        };
        Some(diff * self.volume)
    }
}

// ─── Filter ───────────────────────────────────────────────────────────────────

/// Store-side filter; `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub owner_id: Option<String>,
    pub status: Option<PositionStatus>,
    pub symbol: Option<String>,
}

impl PositionFilter {
    pub fn owned_by(owner_id: impl Into<String>) -> Self {
        Self { owner_id: Some(owner_id.into()), ..Self::default() }
    }

    pub fn with_status(mut self, status: PositionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn matches(&self, position: &Position) -> bool {
        self.owner_id.as_deref().map_or(true, |o| o == position.owner_id)
            && self.status.map_or(true, |s| s == position.status)
            && self.symbol.as_deref().map_or(true, |s| s == position.symbol)
    }
}
