//! # models::action
//!
//! [`Action`] is the message-passing primitive between instances: a persisted
//! work request ("open/close this position on your account") that the owning
//! instance picks up from the change stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Entry,
    Close,
    /// Anything the store hands us that this build does not understand.
    /// Such actions are marked FAILED rather than dropped.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Executing,
    Executed,
    Failed,
}

impl ActionStatus {
    /// EXECUTED / FAILED are never picked up again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Executed | ActionStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: Uuid,
    pub owner_id: String,
    /// Position the owner should act on.
    pub position_id: Uuid,
    /// Position whose close raised this action.
    pub trigger_position_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    pub fn new(owner_id: impl Into<String>, position_id: Uuid, action_type: ActionType) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            position_id,
            trigger_position_id: None,
            action_type,
            status: ActionStatus::Pending,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub owner_id: Option<String>,
    pub status: Option<ActionStatus>,
}

impl ActionFilter {
    pub fn matches(&self, action: &Action) -> bool {
        self.owner_id.as_deref().map_or(true, |o| o == action.owner_id)
            && self.status.map_or(true, |s| s == action.status)
    }
}
