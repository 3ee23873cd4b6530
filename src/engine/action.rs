//! # engine::action
//!
//! **ActionFlowEngine** handles close, partial close and forced batch close.
//!
//! None of these touch the store: the executor owns every status transition
//! and calls in here only for the broker round trip.
//!
//! ## Force close batching
//! ```text
//! OPEN positions ─▶ [batch of 10] ─ join_all ─▶ 10 ms pause ─▶ [next batch] ...
//!                    └ one failure never aborts its siblings
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ForceCloseConfig;
use crate::engine::retry::{send_with_retry, RetryPolicy};
use crate::error::EngineError;
use crate::metrics::{record_quietly, ExecutionKind, ExecutionRecord, MetricsSink};
use crate::models::{ExitReason, Position, PositionStatus};
use crate::transport::{CommandTransport, EaCommand};

/// Volume granularity (lots).
const VOLUME_STEP: f64 = 0.01;

#[inline]
fn round_volume(volume: f64) -> f64 {
    (volume / VOLUME_STEP).round() * VOLUME_STEP
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseOutcome {
    pub position_id: Uuid,
    pub order_id: Option<u64>,
    pub close_price: f64,
    pub closed_volume: f64,
    pub retry_count: u32,
    #[serde(skip)]
    pub execution_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialCloseOutcome {
    pub close: CloseOutcome,
    pub remaining_volume: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedClose {
    pub position_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceCloseReport {
    pub closed: Vec<CloseOutcome>,
    pub failed: Vec<FailedClose>,
    #[serde(serialize_with = "serialize_millis")]
    pub total_time: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct ActionFlowEngine {
    retry: RetryPolicy,
    batching: ForceCloseConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl ActionFlowEngine {
    pub fn new(retry: RetryPolicy, batching: ForceCloseConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { retry, batching, metrics }
    }

    /// Sends the opposite-side close for the whole position at `current_price`.
    pub async fn execute_close(
        &self,
        position: &Position,
        reason: &ExitReason,
        current_price: f64,
        transport: &dyn CommandTransport,
    ) -> Result<CloseOutcome, EngineError> {
        self.send_close(position, position.volume, reason, current_price, transport).await
    }

    /// Closes `close_volume` lots (rounded to 0.01) and reports what is left.
    pub async fn execute_partial_close(
        &self,
        position: &Position,
        close_volume: f64,
        reason: &ExitReason,
        current_price: f64,
        transport: &dyn CommandTransport,
    ) -> Result<PartialCloseOutcome, EngineError> {
        if !(close_volume > 0.0) || close_volume > position.volume {
            return Err(EngineError::Validation(format!(
                "close volume must be in (0, {}], got {close_volume}",
                position.volume
            )));
        }
        let rounded = round_volume(close_volume).min(position.volume);
        if !(rounded > 0.0) {
            return Err(EngineError::Validation(format!(
                "close volume {close_volume} rounds to zero"
            )));
        }

        let close = self.send_close(position, rounded, reason, current_price, transport).await?;
        let remaining_volume = round_volume((position.volume - rounded).max(0.0));
        Ok(PartialCloseOutcome { close, remaining_volume })
    }

    async fn send_close(
        &self,
        position: &Position,
        volume: f64,
        reason: &ExitReason,
        current_price: f64,
        transport: &dyn CommandTransport,
    ) -> Result<CloseOutcome, EngineError> {
        if !matches!(position.status, PositionStatus::Open | PositionStatus::Closing) {
            return Err(EngineError::Validation(format!(
                "position {} is {:?}, not closable",
                position.id, position.status
            )));
        }

        let command = EaCommand::Close {
            account_id: position.account_id.clone(),
            position_id: position.id,
            symbol: position.symbol.clone(),
            volume,
            price: current_price,
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = ?position.side().opposite(),
            volume,
            price = current_price,
            reason = %reason,
            "🧾 [ACTION] Submitting close"
        );

        let delivered = send_with_retry(transport, &command, &self.retry).await?;
        Ok(CloseOutcome {
            position_id: position.id,
            order_id: delivered.ack.order_id,
            close_price: delivered.ack.fill_price.unwrap_or(current_price),
            closed_volume: volume,
            retry_count: delivered.retry_count,
            execution_time: delivered.elapsed,
        })
    }

    /// Closes every OPEN position in `positions`, in concurrent batches.
    ///
    /// `current_prices` is keyed by symbol; positions without a price are
    /// reported failed and never reach the transport.
    pub async fn force_close(
        &self,
        positions: &[Position],
        reason: &ExitReason,
        current_prices: &HashMap<String, f64>,
        transport: &dyn CommandTransport,
    ) -> ForceCloseReport {
        let started = Instant::now();
        let targets: Vec<&Position> = positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .collect();

        info!(count = targets.len(), reason = %reason, "⛔ [ACTION] Force close started");

        let mut closed = Vec::new();
        let mut failed = Vec::new();
        let batch_size = self.batching.batch_size.max(1);

        for (i, batch) in targets.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.batching.batch_pause).await;
            }

            let results = join_all(batch.iter().map(|&position| async move {
                match current_prices.get(&position.symbol) {
                    Some(&price) => self.execute_close(position, reason, price, transport).await,
                    None => Err(EngineError::PriceUnavailable(position.symbol.clone())),
                }
            }))
            .await;

            for (position, result) in batch.iter().zip(results) {
                match result {
                    Ok(outcome) => closed.push(outcome),
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "[ACTION] Force close failed");
                        failed.push(FailedClose { position_id: position.id, error: e.to_string() });
                    }
                }
            }
        }

        let total_time = started.elapsed();
        info!(
            closed = closed.len(),
            failed = failed.len(),
            total_ms = total_time.as_millis() as u64,
            "⛔ [ACTION] Force close finished"
        );
        ForceCloseReport { closed, failed, total_time }
    }

    /// Persists an execution outcome. Sink failures are logged only.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_execution_result(
        &self,
        position: &Position,
        kind: ExecutionKind,
        execution_time: Duration,
        success: bool,
        final_price: Option<f64>,
        error_message: Option<String>,
        retry_count: u32,
    ) {
        let record = ExecutionRecord {
            position_id: position.id,
            execution_type: position.execution_type,
            kind,
            execution_time,
            success,
            final_price,
            profit: final_price.and_then(|p| position.profit_at(p)),
            error_message,
            retry_count,
            recorded_at: Utc::now(),
        };
        record_quietly(self.metrics.as_ref(), &record).await;
    }
}
