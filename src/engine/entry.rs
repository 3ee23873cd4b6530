//! # engine::entry
//!
//! **EntryFlowEngine** decides whether the market allows opening a
//! position and submits the open order.
//!
//! ## Entry gate (all must hold)
//! ```text
//! status == PENDING
//! live market data (never the fallback table)
//! spread     ≤ max_spread        (0.0001)
//! volatility ≤ max_volatility    (0.01)
//! liquidity  >  min_liquidity    (0.5)
//! timing: liquidity > 0.3 && volatility < 0.02
//! ```
//!
//! The order goes out as a limit at `price ± 30% of spread` (plus for BUY,
//! minus for SELL) through the bounded transport retry.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::retry::{send_with_retry, RetryPolicy};
use crate::error::EngineError;
use crate::metrics::{record_quietly, ExecutionKind, ExecutionRecord, MetricsSink};
use crate::models::{MarketCondition, Position, PositionStatus, Side};
use crate::transport::{CommandTransport, EaCommand};

#[derive(Debug, Clone, PartialEq)]
pub struct EntryConfig {
    pub max_spread: f64,
    pub max_volatility: f64,
    pub min_liquidity: f64,
    /// Timing heuristic: minimum liquidity.
    pub timing_min_liquidity: f64,
    /// Timing heuristic: volatility ceiling.
    pub timing_max_volatility: f64,
    /// Share of the spread added to (BUY) or taken off (SELL) the limit price.
    pub slippage_factor: f64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            max_spread: 0.0001,
            max_volatility: 0.01,
            min_liquidity: 0.5,
            timing_min_liquidity: 0.3,
            timing_max_volatility: 0.02,
            slippage_factor: 0.3,
        }
    }
}

/// A filled open order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: Option<u64>,
    pub fill_price: f64,
    pub execution_time: std::time::Duration,
    pub retry_count: u32,
}

pub struct EntryFlowEngine {
    config: EntryConfig,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl EntryFlowEngine {
    pub fn new(config: EntryConfig, retry: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { config, retry, metrics }
    }

    // ─── Gate ─────────────────────────────────────────────────────────────────

    /// Pure check of the entry gate. No side effects.
    pub fn evaluate_entry_condition(&self, position: &Position, market: &MarketCondition) -> bool {
        let c = &self.config;

        let rejection = if position.status != PositionStatus::Pending {
            Some("position not pending")
        } else if market.is_fallback {
            Some("no live market data")
        } else if market.spread > c.max_spread {
            Some("spread too wide")
        } else if market.volatility > c.max_volatility {
            Some("volatility too high")
        } else if market.liquidity <= c.min_liquidity {
            Some("liquidity too thin")
        } else if !self.is_good_timing(market) {
            Some("timing unfavourable")
        } else {
            None
        };

        match rejection {
            Some(reason) => {
                debug!(
                    position_id = %position.id,
                    spread = market.spread,
                    volatility = market.volatility,
                    liquidity = market.liquidity,
                    reason,
                    "❌ [ENTRY] Gate rejected"
                );
                false
            }
            None => true,
        }
    }

    fn is_good_timing(&self, market: &MarketCondition) -> bool {
        market.liquidity > self.config.timing_min_liquidity
            && market.volatility < self.config.timing_max_volatility
    }

    /// Slippage-adjusted limit price for an entry on `side`.
    pub fn limit_price(&self, side: Side, market: &MarketCondition) -> f64 {
        let slippage = market.spread * self.config.slippage_factor;
        match side {
            Side::Buy => market.current_price + slippage,
            Side::Sell => market.current_price - slippage,
        }
    }

    // ─── Execution ────────────────────────────────────────────────────────────

    /// Sends the open command. Records execution metrics whatever happens.
    pub async fn execute_order(
        &self,
        position: &Position,
        market: &MarketCondition,
        transport: &dyn CommandTransport,
    ) -> Result<OrderFill, EngineError> {
        let started = Instant::now();

        if !(position.volume > 0.0) {
            return Err(EngineError::Validation(format!(
                "volume must be positive, got {}",
                position.volume
            )));
        }

        let side = position.side();
        let price = self.limit_price(side, market);
        let command = EaCommand::Open {
            account_id: position.account_id.clone(),
            position_id: position.id,
            symbol: position.symbol.clone(),
            volume: position.volume,
            side,
            price,
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = ?side,
            volume = position.volume,
            limit_price = price,
            "🚀 [ENTRY] Submitting open order"
        );

        let result = send_with_retry(transport, &command, &self.retry).await;
        let execution_time = started.elapsed();

        let (outcome, record) = match result {
            Ok(delivered) => {
                let fill_price = delivered.ack.fill_price.unwrap_or(price);
                let fill = OrderFill {
                    order_id: delivered.ack.order_id,
                    fill_price,
                    execution_time,
                    retry_count: delivered.retry_count,
                };
                info!(
                    position_id = %position.id,
                    ticket = ?fill.order_id,
                    fill_price,
                    retries = fill.retry_count,
                    "✅ [ENTRY] Order filled"
                );
                let record = self.record(position, execution_time, true, Some(fill_price), None, fill.retry_count);
                (Ok(fill), record)
            }
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "❌ [ENTRY] Order failed");
                let retries = e.attempts().saturating_sub(1);
                let record = self.record(position, execution_time, false, None, Some(e.to_string()), retries);
                (Err(e), record)
            }
        };

        record_quietly(self.metrics.as_ref(), &record).await;
        outcome
    }

    fn record(
        &self,
        position: &Position,
        execution_time: std::time::Duration,
        success: bool,
        final_price: Option<f64>,
        error_message: Option<String>,
        retry_count: u32,
    ) -> ExecutionRecord {
        ExecutionRecord {
            position_id: position.id,
            execution_type: position.execution_type,
            kind: ExecutionKind::Open,
            execution_time,
            success,
            final_price,
            profit: None,
            error_message,
            retry_count,
            recorded_at: Utc::now(),
        }
    }

    // ─── Transform ────────────────────────────────────────────────────────────

    /// The filled position: OPEN with entry price, time and broker ticket set.
    pub fn setup_initial_position(
        &self,
        position: &Position,
        fill_price: f64,
        broker_ticket: Option<u64>,
    ) -> Result<Position, EngineError> {
        let mut open = position.transition(PositionStatus::Open)?;
        open.entry_price = Some(fill_price);
        open.entry_time = Some(Utc::now());
        open.broker_ticket = broker_ticket;
        Ok(open)
    }
}
