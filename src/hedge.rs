//! # hedge: hedge pair maintenance
//!
//! Pairing two opposing legs means: whichever leg closes first, the other
//! leg's owner gets a CLOSE action for its leg.
//!
//! ```text
//!  leg A ──triggerActionIds──▶ Action{CLOSE, target=B, owner=B.owner}
//!  leg B ──triggerActionIds──▶ Action{CLOSE, target=A, owner=A.owner}
//! ```
//!
//! Both actions stay PENDING until the executor that closes a leg raises
//! them.

use tracing::info;

use crate::error::EngineError;
use crate::models::{Action, ActionType, Position};
use crate::store::TradeStore;

/// Links `a` and `b` as a hedge pair. Returns both legs as stored.
pub async fn link_hedge_pair(
    store: &dyn TradeStore,
    a: &Position,
    b: &Position,
) -> Result<(Position, Position), EngineError> {
    if a.id == b.id {
        return Err(EngineError::Validation("a position cannot hedge itself".into()));
    }
    for leg in [a, b] {
        if leg.status.is_terminal() {
            return Err(EngineError::Validation(format!(
                "position {} is already {:?}",
                leg.id, leg.status
            )));
        }
    }

    let close_b = store.create_action(Action::new(b.owner_id.clone(), b.id, ActionType::Close)).await?;
    let close_a = store.create_action(Action::new(a.owner_id.clone(), a.id, ActionType::Close)).await?;

    let leg_a = append_trigger(store, a, close_b.id).await?;
    let leg_b = append_trigger(store, b, close_a.id).await?;

    info!(
        leg_a = %leg_a.id,
        leg_b = %leg_b.id,
        owner_a = %leg_a.owner_id,
        owner_b = %leg_b.owner_id,
        "🔗 Hedge pair linked"
    );
    Ok((leg_a, leg_b))
}

/// Appends to the stored record, not the caller's copy, so concurrent
/// status changes are not overwritten.
async fn append_trigger(
    store: &dyn TradeStore,
    leg: &Position,
    action_id: uuid::Uuid,
) -> Result<Position, EngineError> {
    let mut current = store
        .get_position(leg.id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("position {}", leg.id)))?;
    if !current.trigger_action_ids.contains(&action_id) {
        current.trigger_action_ids.push(action_id);
    }
    Ok(store.update_position(current).await?)
}
