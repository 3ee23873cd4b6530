//! # store: Position / Action store collaborator
//!
//! The backing store is external; this module fixes its boundary
//! ([`TradeStore`]) and ships [`InMemoryStore`], which the binary and the
//! tests run against.
//!
//! Subscriptions deliver **every** change to **every** subscriber. Deciding
//! which changes belong to this instance is the executor's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::models::{Action, ActionFilter, Position, PositionFilter};

/// Change-stream buffer per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: Uuid },

    #[error("{kind} {id} does not exist")]
    Missing { kind: &'static str, id: Uuid },

    /// The external backend failed the call (connection lost, timeout...).
    /// Nothing was written.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// One write, as seen by subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreEvent {
    Position(Position),
    Action(Action),
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create_position(&self, position: Position) -> Result<Position, StoreError>;
    async fn update_position(&self, position: Position) -> Result<Position, StoreError>;
    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;
    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, StoreError>;

    async fn create_action(&self, action: Action) -> Result<Action, StoreError>;
    async fn update_action(&self, action: Action) -> Result<Action, StoreError>;
    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, StoreError>;
    async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError>;

    /// A fresh receiver for the full change stream.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

// ─── In-memory implementation ─────────────────────────────────────────────────

pub struct InMemoryStore {
    positions: RwLock<HashMap<Uuid, Position>>,
    actions: RwLock<HashMap<Uuid, Action>>,
    events: broadcast::Sender<StoreEvent>,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            positions: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            events,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of create/update calls that reached the store.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn publish(&self, event: StoreEvent) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        // Err only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for InMemoryStore {
    async fn create_position(&self, mut position: Position) -> Result<Position, StoreError> {
        position.updated_at = Utc::now();
        {
            let mut table = self.positions.write().await;
            if table.contains_key(&position.id) {
                return Err(StoreError::Duplicate { kind: "position", id: position.id });
            }
            table.insert(position.id, position.clone());
        }
        self.publish(StoreEvent::Position(position.clone()));
        Ok(position)
    }

    async fn update_position(&self, mut position: Position) -> Result<Position, StoreError> {
        position.updated_at = Utc::now();
        {
            let mut table = self.positions.write().await;
            let slot = table
                .get_mut(&position.id)
                .ok_or(StoreError::Missing { kind: "position", id: position.id })?;
            *slot = position.clone();
        }
        self.publish(StoreEvent::Position(position.clone()));
        Ok(position)
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, StoreError> {
        let table = self.positions.read().await;
        let mut out: Vec<Position> = table.values().filter(|p| filter.matches(p)).cloned().collect();
        out.sort_by_key(|p| p.updated_at);
        Ok(out)
    }

    async fn create_action(&self, mut action: Action) -> Result<Action, StoreError> {
        action.updated_at = Utc::now();
        {
            let mut table = self.actions.write().await;
            if table.contains_key(&action.id) {
                return Err(StoreError::Duplicate { kind: "action", id: action.id });
            }
            table.insert(action.id, action.clone());
        }
        self.publish(StoreEvent::Action(action.clone()));
        Ok(action)
    }

    async fn update_action(&self, mut action: Action) -> Result<Action, StoreError> {
        action.updated_at = Utc::now();
        {
            let mut table = self.actions.write().await;
            let slot = table
                .get_mut(&action.id)
                .ok_or(StoreError::Missing { kind: "action", id: action.id })?;
            *slot = action.clone();
        }
        self.publish(StoreEvent::Action(action.clone()));
        Ok(action)
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, StoreError> {
        Ok(self.actions.read().await.get(&id).cloned())
    }

    async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        let table = self.actions.read().await;
        let mut out: Vec<Action> = table.values().filter(|a| filter.matches(a)).cloned().collect();
        out.sort_by_key(|a| a.updated_at);
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ─── Test double ──────────────────────────────────────────────────────────────
