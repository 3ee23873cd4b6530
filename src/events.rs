//! # events
//!
//! Defines [`EngineEvent`], everything the executor announces on the
//! monitor channel (`/ws/monitor`).
//!
//! Events go out over `tokio::sync::broadcast::Sender<String>` as
//! pre-serialised JSON so subscribers never need `Clone` on the payload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{ActionStatus, ActionType, ExitReason, Position};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    PositionOpened {
        position: Box<Position>,
    },

    PositionClosed {
        position: Box<Position>,
    },

    /// Entry refused or failed, withdrawn, or close left unresolved.
    PositionCanceled {
        position_id: Uuid,
        reason: ExitReason,
        error: Option<String>,
    },

    /// Broker-initiated stop-out.
    PositionStopped {
        position: Box<Position>,
    },

    /// Partial close left `remaining_volume` on the book.
    PositionReduced {
        position_id: Uuid,
        closed_volume: f64,
        remaining_volume: f64,
    },

    TrailRatcheted {
        position_id: Uuid,
        trigger_price: f64,
    },

    TrailTriggered {
        position_id: Uuid,
        price: f64,
        trigger_price: f64,
    },

    /// This instance moved an Action to EXECUTING for its owner to pick up.
    ActionRaised {
        action_id: Uuid,
        owner_id: String,
        target_position_id: Uuid,
        action_type: ActionType,
    },

    ActionCompleted {
        action_id: Uuid,
        status: ActionStatus,
        error: Option<String>,
    },

    /// The broker side is in an unknown state; an operator has to look.
    ReconciliationRequired {
        position_id: Uuid,
        attempts: u32,
        error: String,
    },

    PriceFallback {
        symbol: String,
        price: f64,
    },

    /// First push from an account's EA, or the first after it went silent.
    EaLinkUp {
        account_id: String,
    },

    EaLinkLost {
        account_id: String,
        last_seen: DateTime<Utc>,
    },
}

impl EngineEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let json = EngineEvent::TrailTriggered {
            position_id: Uuid::nil(),
            price: 1.0999,
            trigger_price: 1.1,
        }
        .to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["event"], "TRAIL_TRIGGERED");
        assert_eq!(v["trigger_price"], 1.1);
    }
}
