//! Domain models shared across the hedge-system node.

pub mod action;
pub mod position;
pub mod tick;

pub use action::{Action, ActionFilter, ActionStatus, ActionType};
pub use position::{ExecutionType, ExitReason, Position, PositionFilter, PositionStatus, Side};
pub use tick::{MarketCondition, Quote, TickData};
