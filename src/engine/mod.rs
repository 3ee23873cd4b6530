//! The execution engines. `entry`, `trail` and `action` are the leaves;
//! `executor` composes them and is the only part that talks to the store,
//! the price feed and the EA bridge.

pub mod action;
pub mod entry;
pub mod executor;
pub mod retry;
pub mod trail;
