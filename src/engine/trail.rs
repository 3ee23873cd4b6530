//! # engine::trail
//!
//! **TrailFlowEngine**: a ratcheting stop per open position.
//!
//! ```text
//! BUY  : price > high-water mark → hwm = price, trigger = price − width   (trigger only rises)
//!        price ≤ trigger         → TRIGGERED (once)
//! SELL : price < low-water mark  → lwm = price, trigger = price + width   (trigger only falls)
//!        price ≥ trigger         → TRIGGERED (once)
//! ```
//!
//! Evaluation is a single `HashMap` lookup with no I/O; it runs on every tick.
//! The table belongs to the local instance only and is never shared.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Position, Side};

/// Watermark state for one position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailCondition {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Side,
    pub entry_price: f64,
    pub current_price: f64,
    pub trail_width: f64,
    /// High-water mark for BUY, low-water mark for SELL.
    pub watermark: f64,
    pub trigger_price: f64,
    pub is_triggered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailEvaluation {
    pub is_triggered: bool,
    /// Set when this tick ratcheted the trigger.
    pub new_trigger_price: Option<f64>,
}

impl TrailEvaluation {
    const HOLD: TrailEvaluation = TrailEvaluation { is_triggered: false, new_trigger_price: None };
}

#[derive(Debug, Default)]
pub struct TrailFlowEngine {
    conditions: HashMap<Uuid, TrailCondition>,
}

impl TrailFlowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) trailing `position` from `current_price`.
    pub fn initialize_trail_condition(
        &mut self,
        position: &Position,
        current_price: f64,
    ) -> Result<&TrailCondition, EngineError> {
        if !(position.trail_width > 0.0) {
            return Err(EngineError::Validation(format!(
                "trailWidth must be positive to trail, got {}",
                position.trail_width
            )));
        }
        if !(current_price > 0.0) {
            return Err(EngineError::Validation(format!(
                "current price must be positive, got {current_price}"
            )));
        }

        let direction = position.side();
        let trigger_price = match direction {
            Side::Buy => current_price - position.trail_width,
            Side::Sell => current_price + position.trail_width,
        };

        let condition = TrailCondition {
            position_id: position.id,
            symbol: position.symbol.clone(),
            direction,
            entry_price: position.entry_price.unwrap_or(current_price),
            current_price,
            trail_width: position.trail_width,
            watermark: current_price,
            trigger_price,
            is_triggered: false,
        };

        info!(
            position_id = %position.id,
            direction = ?direction,
            watermark = current_price,
            trigger_price,
            "🎯 [TRAIL] Initialised"
        );

        self.conditions.insert(position.id, condition);
        // just inserted
        Ok(&self.conditions[&position.id])
    }

    /// `None` if the position is not being trailed.
    pub fn evaluate_trail_condition(&mut self, position_id: Uuid, price: f64) -> Option<TrailEvaluation> {
        let c = self.conditions.get_mut(&position_id)?;

        if c.is_triggered {
            return Some(TrailEvaluation::HOLD);
        }
        c.current_price = price;

        let favourable = match c.direction {
            Side::Buy => price > c.watermark,
            Side::Sell => price < c.watermark,
        };

        if favourable {
            let candidate = match c.direction {
                Side::Buy => price - c.trail_width,
                Side::Sell => price + c.trail_width,
            };
            c.watermark = price;
            // Ratchet only; a manual tighten may already sit beyond the candidate.
            let improves = match c.direction {
                Side::Buy => candidate > c.trigger_price,
                Side::Sell => candidate < c.trigger_price,
            };
            if !improves {
                return Some(TrailEvaluation::HOLD);
            }
            c.trigger_price = candidate;
            debug!(position_id = %position_id, watermark = price, trigger = candidate, "[TRAIL] Ratcheted");
            return Some(TrailEvaluation { is_triggered: false, new_trigger_price: Some(candidate) });
        }

        let breached = match c.direction {
            Side::Buy => price <= c.trigger_price,
            Side::Sell => price >= c.trigger_price,
        };
        if breached {
            c.is_triggered = true;
            info!(
                position_id = %position_id,
                price,
                trigger_price = c.trigger_price,
                "🔔 [TRAIL] Triggered"
            );
            return Some(TrailEvaluation { is_triggered: true, new_trigger_price: None });
        }

        Some(TrailEvaluation::HOLD)
    }

    /// Manual override of the trigger.
    ///
    /// Rejected when the new trigger is already breached at `current_price`
    /// or would loosen the stop.
    pub fn update_stop_loss(
        &mut self,
        position_id: Uuid,
        new_trigger: f64,
        current_price: f64,
    ) -> Result<f64, EngineError> {
        let c = self
            .conditions
            .get_mut(&position_id)
            .ok_or_else(|| EngineError::NotFound(format!("trail for position {position_id}")))?;

        let (breached, loosens) = match c.direction {
            Side::Buy => (new_trigger >= current_price, new_trigger < c.trigger_price),
            Side::Sell => (new_trigger <= current_price, new_trigger > c.trigger_price),
        };
        if breached {
            return Err(EngineError::Validation(format!(
                "trigger {new_trigger} already breached at price {current_price}"
            )));
        }
        if loosens {
            return Err(EngineError::Validation(format!(
                "trigger {new_trigger} would retreat from {}",
                c.trigger_price
            )));
        }

        c.trigger_price = new_trigger;
        info!(position_id = %position_id, trigger_price = new_trigger, "[TRAIL] Stop-loss overridden");
        Ok(new_trigger)
    }

    /// Volatility-scaled tightening: puts the trigger `width × multiplier`
    /// from the watermark. Returns the new trigger, or `None` when that would
    /// not tighten the stop.
    pub fn adjust_profit_level(
        &mut self,
        position_id: Uuid,
        width_multiplier: f64,
        current_price: f64,
    ) -> Result<Option<f64>, EngineError> {
        if !(width_multiplier > 0.0) {
            return Err(EngineError::Validation(format!(
                "width multiplier must be positive, got {width_multiplier}"
            )));
        }
        let c = self
            .conditions
            .get(&position_id)
            .ok_or_else(|| EngineError::NotFound(format!("trail for position {position_id}")))?;

        let width = c.trail_width * width_multiplier;
        let candidate = match c.direction {
            Side::Buy => c.watermark - width,
            Side::Sell => c.watermark + width,
        };
        let tightens = match c.direction {
            Side::Buy => candidate > c.trigger_price,
            Side::Sell => candidate < c.trigger_price,
        };
        if !tightens {
            return Ok(None);
        }
        self.update_stop_loss(position_id, candidate, current_price).map(Some)
    }

    pub fn remove_trail_condition(&mut self, position_id: Uuid) -> Option<TrailCondition> {
        let removed = self.conditions.remove(&position_id);
        if removed.is_some() {
            debug!(position_id = %position_id, "[TRAIL] Removed");
        }
        removed
    }

    pub fn get(&self, position_id: Uuid) -> Option<&TrailCondition> {
        self.conditions.get(&position_id)
    }

    pub fn contains(&self, position_id: Uuid) -> bool {
        self.conditions.contains_key(&position_id)
    }

    /// Positions trailed on `symbol` with their direction.
    pub fn positions_for(&self, symbol: &str) -> Vec<(Uuid, Side)> {
        self.conditions
            .values()
            .filter(|c| c.symbol == symbol)
            .map(|c| (c.position_id, c.direction))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionType, PositionStatus};
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn open(execution_type: ExecutionType, entry: f64, width: f64) -> Position {
        let mut p = Position::new("user-a", "acc-1", "EURUSD", 0.1, execution_type, width);
        p.status = PositionStatus::Open;
        p.entry_price = Some(entry);
        p
    }

    #[test]
    fn test_buy_scenario_ratchets_then_triggers() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();

        let r = engine.evaluate_trail_condition(p.id, 1.1005).unwrap();
        assert!(!r.is_triggered);
        let c = engine.get(p.id).unwrap();
        assert!((c.watermark - 1.1005).abs() < EPS);
        assert!((c.trigger_price - 1.0995).abs() < EPS);

        let r = engine.evaluate_trail_condition(p.id, 1.1010).unwrap();
        assert!(!r.is_triggered);
        let c = engine.get(p.id).unwrap();
        assert!((c.watermark - 1.1010).abs() < EPS);
        assert!((c.trigger_price - 1.1000).abs() < EPS);

        let r = engine.evaluate_trail_condition(p.id, 1.0999).unwrap();
        assert!(r.is_triggered);
    }

    #[test]
    fn test_sell_mirrors_buy() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Exit, 1.1000, 0.0010);
        let c = engine.initialize_trail_condition(&p, 1.1000).unwrap();
        assert_eq!(c.direction, Side::Sell);
        assert!((c.trigger_price - 1.1010).abs() < EPS);

        let r = engine.evaluate_trail_condition(p.id, 1.0990).unwrap();
        assert!((r.new_trigger_price.unwrap() - 1.1000).abs() < EPS);
        assert!(!engine.evaluate_trail_condition(p.id, 1.0995).unwrap().is_triggered);
        assert!(engine.evaluate_trail_condition(p.id, 1.1001).unwrap().is_triggered);
    }

    #[test]
    fn test_repeated_price_is_idempotent() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();

        let first = engine.evaluate_trail_condition(p.id, 1.1005).unwrap();
        let second = engine.evaluate_trail_condition(p.id, 1.1005).unwrap();
        assert!(first.new_trigger_price.is_some());
        assert_eq!(second, TrailEvaluation::HOLD);

        assert!(engine.evaluate_trail_condition(p.id, 1.0990).unwrap().is_triggered);
        // no duplicate trigger at the same or worse price
        assert!(!engine.evaluate_trail_condition(p.id, 1.0990).unwrap().is_triggered);
        assert!(!engine.evaluate_trail_condition(p.id, 1.0900).unwrap().is_triggered);
    }

    #[test]
    fn test_reinitialise_rearms() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();
        assert!(engine.evaluate_trail_condition(p.id, 1.0980).unwrap().is_triggered);

        engine.initialize_trail_condition(&p, 1.0980).unwrap();
        assert!(engine.evaluate_trail_condition(p.id, 1.0965).unwrap().is_triggered);
    }

    #[test]
    fn test_unknown_position_and_removal() {
        let mut engine = TrailFlowEngine::new();
        assert!(engine.evaluate_trail_condition(Uuid::new_v4(), 1.0).is_none());

        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();
        assert!(engine.remove_trail_condition(p.id).is_some());
        assert!(engine.evaluate_trail_condition(p.id, 1.0).is_none());
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn test_zero_width_rejected() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0);
        assert!(matches!(
            engine.initialize_trail_condition(&p, 1.1),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_update_stop_loss_validation() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();

        // already breached
        assert!(engine.update_stop_loss(p.id, 1.1001, 1.1000).is_err());
        // would loosen (current trigger 1.0990)
        assert!(engine.update_stop_loss(p.id, 1.0980, 1.1000).is_err());
        // tighten
        assert_eq!(engine.update_stop_loss(p.id, 1.0995, 1.1000).unwrap(), 1.0995);
        assert!(engine.evaluate_trail_condition(p.id, 1.0995).unwrap().is_triggered);
    }

    #[test]
    fn test_adjust_profit_level_only_tightens() {
        let mut engine = TrailFlowEngine::new();
        let p = open(ExecutionType::Entry, 1.1000, 0.0010);
        engine.initialize_trail_condition(&p, 1.1000).unwrap();

        assert_eq!(engine.adjust_profit_level(p.id, 2.0, 1.1000).unwrap(), None);
        let tightened = engine.adjust_profit_level(p.id, 0.5, 1.1000).unwrap().unwrap();
        assert!((tightened - 1.0995).abs() < EPS);
    }

    proptest! {
        #[test]
        fn prop_buy_trigger_never_decreases(prices in prop::collection::vec(1.0f64..1.2, 1..200)) {
            let mut engine = TrailFlowEngine::new();
            let p = open(ExecutionType::Entry, 1.1, 0.0010);
            engine.initialize_trail_condition(&p, 1.1).unwrap();
            let mut last = engine.get(p.id).unwrap().trigger_price;
            for price in prices {
                engine.evaluate_trail_condition(p.id, price);
                let now = engine.get(p.id).unwrap().trigger_price;
                prop_assert!(now >= last);
                last = now;
            }
        }

        #[test]
        fn prop_sell_trigger_never_increases(prices in prop::collection::vec(1.0f64..1.2, 1..200)) {
            let mut engine = TrailFlowEngine::new();
            let p = open(ExecutionType::Exit, 1.1, 0.0010);
            engine.initialize_trail_condition(&p, 1.1).unwrap();
            let mut last = engine.get(p.id).unwrap().trigger_price;
            for price in prices {
                engine.evaluate_trail_condition(p.id, price);
                let now = engine.get(p.id).unwrap().trigger_price;
                prop_assert!(now <= last);
                last = now;
            }
        }

        #[test]
        fn prop_triggers_at_most_once(prices in prop::collection::vec(1.0f64..1.2, 1..200)) {
            let mut engine = TrailFlowEngine::new();
            let p = open(ExecutionType::Entry, 1.1, 0.0010);
            engine.initialize_trail_condition(&p, 1.1).unwrap();
            let fired = prices
                .into_iter()
                .filter(|&price| engine.evaluate_trail_condition(p.id, price).unwrap().is_triggered)
                .count();
            prop_assert!(fired <= 1);
        }
    }
}
