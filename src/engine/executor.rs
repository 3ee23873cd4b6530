//! # engine::executor
//!
//! The **PositionExecutor** drives the position state machine for the
//! records this instance owns and hands everything else off through Action
//! records.
//!
//! ```text
//!             execute            fill
//!  PENDING ──────────▶ OPENING ───────▶ OPEN ──────────▶ CLOSING ──▶ CLOSED
//!     │                   │              │  ▲   close       │
//!     │ withdraw / gate   │ rejected /   │  └── rejected ───┤
//!     ▼                   ▼ exhausted    │                  │ unresolved
//!  CANCELED ◀─────────────┘              ▼                  ▼
//!                                     STOPPED            CANCELED
//! ```
//!
//! Every inbound change goes through [`InstanceIdentity::owns`] first.
//! A record that fails the check produces no store write, no transport call
//! and no trail state.
//!
//! Only one command per position is in flight at a time; a second request
//! gets `CommandInFlight` instead of queueing behind the first. The claim is
//! taken before the record is read, so the status a command starts from
//! includes every write of the previous holder.
//!
//! Status writes before dispatch fail fast. Writes after the broker has
//! answered are retried, then reported as `RECONCILIATION_REQUIRED`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::action::{ActionFlowEngine, CloseOutcome, FailedClose, ForceCloseReport};
use crate::engine::entry::EntryFlowEngine;
use crate::engine::retry::send_with_retry;
use crate::engine::trail::{TrailCondition, TrailFlowEngine};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::metrics::ExecutionKind;
use crate::models::{
    Action, ActionStatus, ActionType, ExitReason, Position, PositionFilter, PositionStatus, TickData,
};
use crate::price_feed::{resolve_market_condition, resolve_quote};
use crate::state::EngineContext;
use crate::store::{StoreEvent, TradeStore};
use crate::transport::EaCommand;

/// Remaining volume below this counts as fully closed.
const VOLUME_EPSILON: f64 = 0.005;

fn lock_ids(set: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a position as having a command in flight until dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock_ids(self.set).remove(&self.id);
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────────

pub struct PositionExecutor {
    ctx: Arc<EngineContext>,
    entry: EntryFlowEngine,
    actions: ActionFlowEngine,
    trail: AsyncMutex<TrailFlowEngine>,
    in_flight: Mutex<HashSet<Uuid>>,
    /// Actions this instance has already picked up.
    consumed_actions: Mutex<HashSet<Uuid>>,
}

impl PositionExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let config = &ctx.config;
        let entry = EntryFlowEngine::new(config.entry.clone(), config.retry, ctx.metrics.clone());
        let actions = ActionFlowEngine::new(config.retry, config.force_close.clone(), ctx.metrics.clone());
        Self {
            entry,
            actions,
            trail: AsyncMutex::new(TrailFlowEngine::new()),
            in_flight: Mutex::new(HashSet::new()),
            consumed_actions: Mutex::new(HashSet::new()),
            ctx,
        }
    }

    // ─── Subscription loop ────────────────────────────────────────────────────

    /// Consumes the store change stream until it closes.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.ctx.store.subscribe();
        info!(user_id = %self.ctx.identity.user_id(), "👂 [EXECUTOR] Listening for position/action changes");

        loop {
            match rx.recv().await {
                Ok(StoreEvent::Position(position)) => self.on_position_event(&position).await,
                Ok(StoreEvent::Action(action)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.on_action_event(&action).await });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "[EXECUTOR] Change stream lagged — events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("[EXECUTOR] Change stream closed");
    }

    /// Keeps trail state in step with an owned position's status.
    pub async fn on_position_event(&self, position: &Position) {
        if !self.ctx.identity.owns(position) {
            return;
        }

        if position.status.is_terminal() {
            self.trail.lock().await.remove_trail_condition(position.id);
        } else if position.status == PositionStatus::Open && position.has_trail() {
            let armed = self.trail.lock().await.contains(position.id);
            if !armed {
                self.arm_trail(position, None).await;
            }
        }
    }

    /// Runs an owned EXECUTING action once and records the outcome on it.
    pub async fn on_action_event(&self, action: &Action) {
        if !self.ctx.identity.owns(action) {
            return;
        }
        if action.status.is_terminal() {
            lock_ids(&self.consumed_actions).remove(&action.id);
            return;
        }
        if action.status != ActionStatus::Executing {
            return;
        }
        if !lock_ids(&self.consumed_actions).insert(action.id) {
            debug!(action_id = %action.id, "[ACTION] Already consumed");
            return;
        }
        // a redelivered event may be older than the record
        match self.ctx.store.get_action(action.id).await {
            Ok(Some(current)) if current.status == ActionStatus::Executing => {}
            Ok(current) => {
                debug!(action_id = %action.id, status = ?current.map(|a| a.status), "[ACTION] No longer executing");
                lock_ids(&self.consumed_actions).remove(&action.id);
                return;
            }
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "[ACTION] Could not re-read action");
                lock_ids(&self.consumed_actions).remove(&action.id);
                return;
            }
        }

        info!(
            action_id = %action.id,
            action_type = ?action.action_type,
            target = %action.position_id,
            source = ?action.trigger_position_id,
            "📨 [ACTION] Executing"
        );

        let result = match action.action_type {
            ActionType::Entry => match self.execute_entry(action.position_id).await {
                Ok(p) if p.status == PositionStatus::Open => Ok(()),
                Ok(p) => Err(format!("entry ended {:?}", p.status)),
                Err(e) => Err(e.to_string()),
            },
            ActionType::Close => match self.execute_close(action.position_id, ExitReason::ActionTriggered).await {
                Ok(_) => Ok(()),
                // the other leg's close already got there
                Err(EngineError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    debug!(action_id = %action.id, status = ?from, "[ACTION] Target already closed");
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
            ActionType::Unknown => {
                warn!(action_id = %action.id, "❌ [ACTION] Unknown action type — rejecting");
                Err("unknown action type".to_string())
            }
        };

        let (status, error) = match result {
            Ok(()) => (ActionStatus::Executed, None),
            Err(e) => (ActionStatus::Failed, Some(e)),
        };

        let mut done = action.clone();
        done.status = status;
        if let Err(e) = self.ctx.store.update_action(done).await {
            error!(action_id = %action.id, error = %e, "[ACTION] Could not record outcome");
        }
        lock_ids(&self.consumed_actions).remove(&action.id);
        self.ctx.broadcast(&EngineEvent::ActionCompleted { action_id: action.id, status, error });
    }

    // ─── Ticks ────────────────────────────────────────────────────────────────

    /// Trail evaluation only. Returns the positions whose trigger fired on
    /// this tick; closing them is the caller's job.
    pub async fn evaluate_tick(&self, tick: &TickData) -> Vec<Uuid> {
        self.ctx.tick_count.fetch_add(1, Ordering::Relaxed);
        let quote = tick.quote();
        let mut trail = self.trail.lock().await;
        let mut triggered = Vec::new();

        for (position_id, side) in trail.positions_for(&tick.symbol) {
            let price = quote.exit_price(side);
            let Some(eval) = trail.evaluate_trail_condition(position_id, price) else {
                continue;
            };
            if let Some(trigger_price) = eval.new_trigger_price {
                self.ctx.broadcast(&EngineEvent::TrailRatcheted { position_id, trigger_price });
            }
            if eval.is_triggered {
                let trigger_price = trail.get(position_id).map(|c| c.trigger_price).unwrap_or(price);
                self.ctx.trigger_count.fetch_add(1, Ordering::Relaxed);
                self.ctx.broadcast(&EngineEvent::TrailTriggered { position_id, price, trigger_price });
                triggered.push(position_id);
            }
        }
        triggered
    }

    /// Evaluates a tick and closes whatever triggered, in order.
    pub async fn on_price_tick(&self, tick: &TickData) -> Vec<Uuid> {
        let triggered = self.evaluate_tick(tick).await;
        for &position_id in &triggered {
            self.handle_trail_trigger(position_id).await;
        }
        triggered
    }

    pub async fn handle_trail_trigger(&self, position_id: Uuid) {
        if let Err(e) = self.execute_close(position_id, ExitReason::TrailStop).await {
            warn!(position_id = %position_id, error = %e, "[TRAIL] Triggered close failed");
        }
    }

    pub async fn trail_snapshot(&self, position_id: Uuid) -> Option<TrailCondition> {
        self.trail.lock().await.get(position_id).cloned()
    }

    pub async fn trailed_positions(&self) -> usize {
        self.trail.lock().await.len()
    }

    // ─── Entry ────────────────────────────────────────────────────────────────

    /// PENDING → OPENING → OPEN, or CANCELED when the gate refuses or the
    /// order fails. A refused gate is `Ok` with the canceled record.
    pub async fn execute_entry(&self, position_id: Uuid) -> Result<Position, EngineError> {
        let (_claim, position) = self.claim_owned(position_id).await?;
        if position.status != PositionStatus::Pending {
            return Err(EngineError::InvalidTransition {
                position_id,
                from: position.status,
                to: PositionStatus::Opening,
            });
        }
        position.validate()?;
        // stays PENDING; retried once the EA is heard from
        self.ctx.ea_links.ensure_live(&position.account_id, Utc::now()).await?;

        let Some(market) = resolve_market_condition(self.ctx.price_feed.as_ref(), &position.symbol).await
        else {
            let err = EngineError::PriceUnavailable(position.symbol.clone());
            self.cancel_position(&position, ExitReason::EntryRejected, Some(err.to_string())).await?;
            return Err(err);
        };
        if market.is_fallback {
            self.ctx.broadcast(&EngineEvent::PriceFallback {
                symbol: position.symbol.clone(),
                price: market.current_price,
            });
        }

        if !self.entry.evaluate_entry_condition(&position, &market) {
            info!(position_id = %position_id, "⏸️ [ENTRY] Conditions not met — canceling");
            return self
                .cancel_position(&position, ExitReason::EntryRejected, Some("entry conditions not met".into()))
                .await;
        }

        let opening = self.ctx.store.update_position(position.transition(PositionStatus::Opening)?).await?;

        match self.entry.execute_order(&opening, &market, self.ctx.transport.as_ref()).await {
            Ok(fill) => {
                let open = self.entry.setup_initial_position(&opening, fill.fill_price, fill.order_id)?;
                let open = self.persist_outcome(open).await?;
                self.arm_trail(&open, Some(fill.fill_price)).await;
                self.ctx.broadcast(&EngineEvent::PositionOpened { position: Box::new(open.clone()) });
                Ok(open)
            }
            Err(e) => {
                self.cancel_position(&opening, ExitReason::EntryRejected, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// Withdraws a PENDING position whose entry has not been dispatched.
    pub async fn cancel_pending(&self, position_id: Uuid) -> Result<Position, EngineError> {
        let (_claim, position) = self.claim_owned(position_id).await?;
        if position.status != PositionStatus::Pending {
            return Err(EngineError::InvalidTransition {
                position_id,
                from: position.status,
                to: PositionStatus::Canceled,
            });
        }
        self.cancel_position(&position, ExitReason::Withdrawn, None).await
    }

    // ─── Close ────────────────────────────────────────────────────────────────

    /// OPEN → CLOSING → CLOSED. A broker rejection rolls back to OPEN;
    /// exhausted transport retries hand over to the supervisory loop.
    pub async fn execute_close(&self, position_id: Uuid, reason: ExitReason) -> Result<Position, EngineError> {
        let (_claim, position) = self.claim_owned(position_id).await?;
        let closing = position.transition(PositionStatus::Closing)?;
        if let Err(e) = self.ctx.ea_links.ensure_live(&position.account_id, Utc::now()).await {
            // closes still go out; the retry layer decides
            warn!(position_id = %position_id, error = %e, "[EXECUTOR] Closing through a silent EA link");
        }
        let closing = self.ctx.store.update_position(closing).await?;

        let Some(price) = self.exit_price(&closing).await else {
            self.rollback_close(&closing, None).await?;
            return Err(EngineError::PriceUnavailable(closing.symbol.clone()));
        };

        match self
            .actions
            .execute_close(&closing, &reason, price, self.ctx.transport.as_ref())
            .await
        {
            Ok(outcome) => {
                self.record_close(&closing, ExecutionKind::Close, &outcome).await;
                self.finish_close(&closing, reason, &outcome).await
            }
            Err(e) if e.is_exhausted() => self.supervise_close(closing, reason, e).await,
            Err(e) => {
                self.record_close_failure(&closing, ExecutionKind::Close, &e).await;
                self.rollback_close(&closing, Some(price)).await?;
                Err(e)
            }
        }
    }

    /// Extra close rounds after the transport budget ran out, each with a
    /// fresh price. Gives up as CANCELED / `Unresolved`.
    async fn supervise_close(
        &self,
        closing: Position,
        reason: ExitReason,
        first_error: EngineError,
    ) -> Result<Position, EngineError> {
        let policy = self.ctx.config.retry;
        let rounds = self.ctx.config.supervisor_retries;
        let mut attempts = first_error.attempts();
        let mut last_error = first_error;

        for round in 1..=rounds {
            let delay = policy.delay_for(round);
            warn!(
                position_id = %closing.id,
                round,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "🔁 [EXECUTOR] Close unresolved — supervisory retry"
            );
            tokio::time::sleep(delay).await;

            let Some(price) = self.exit_price(&closing).await else {
                last_error = EngineError::PriceUnavailable(closing.symbol.clone());
                continue;
            };

            match self
                .actions
                .execute_close(&closing, &reason, price, self.ctx.transport.as_ref())
                .await
            {
                Ok(mut outcome) => {
                    outcome.retry_count += attempts;
                    self.record_close(&closing, ExecutionKind::Close, &outcome).await;
                    return self.finish_close(&closing, reason, &outcome).await;
                }
                Err(e) if e.is_exhausted() => {
                    attempts += e.attempts();
                    last_error = e;
                }
                Err(e) => {
                    self.record_close_failure(&closing, ExecutionKind::Close, &e).await;
                    self.rollback_close(&closing, Some(price)).await?;
                    return Err(e);
                }
            }
        }

        let last_error = last_error.to_string();
        error!(
            position_id = %closing.id,
            attempts,
            error = %last_error,
            "🚨 [EXECUTOR] Close unresolved — manual reconciliation required"
        );
        let exhausted = EngineError::RetriesExhausted { attempts, last_error: last_error.clone() };
        self.record_close_failure(&closing, ExecutionKind::Close, &exhausted).await;
        self.cancel_position(&closing, ExitReason::Unresolved, Some(last_error.clone())).await?;
        self.ctx.broadcast(&EngineEvent::ReconciliationRequired {
            position_id: closing.id,
            attempts,
            error: last_error,
        });
        Err(exhausted)
    }

    async fn finish_close(
        &self,
        closing: &Position,
        reason: ExitReason,
        outcome: &CloseOutcome,
    ) -> Result<Position, EngineError> {
        let mut closed = closing.transition(PositionStatus::Closed)?;
        closed.exit_price = Some(outcome.close_price);
        closed.exit_time = Some(Utc::now());
        closed.exit_reason = Some(reason);
        // filled at the broker: never trail it again, even if the write fails
        self.trail.lock().await.remove_trail_condition(closed.id);
        let closed = self.persist_outcome(closed).await?;

        info!(
            position_id = %closed.id,
            exit_price = outcome.close_price,
            profit = ?closed.profit_at(outcome.close_price),
            retries = outcome.retry_count,
            "✅ [EXECUTOR] Position closed"
        );
        self.ctx.broadcast(&EngineEvent::PositionClosed { position: Box::new(closed.clone()) });
        self.raise_trigger_actions(&closed).await;
        Ok(closed)
    }

    /// CLOSING → OPEN with the trail re-armed from the current price.
    async fn rollback_close(&self, closing: &Position, price: Option<f64>) -> Result<Position, EngineError> {
        let open = self.persist_outcome(closing.transition(PositionStatus::Open)?).await?;
        warn!(position_id = %open.id, "↩️ [EXECUTOR] Close failed — position back to OPEN");
        self.arm_trail(&open, price).await;
        Ok(open)
    }

    /// Broker-side stop-out, applied straight from OPEN.
    pub async fn apply_stop_out(&self, position_id: Uuid, exit_price: Option<f64>) -> Result<Position, EngineError> {
        let position = self.load_owned(position_id).await?;
        let mut stopped = position.transition(PositionStatus::Stopped)?;
        let exit_price = match exit_price {
            Some(p) => Some(p),
            None => self.exit_price(&position).await,
        };
        stopped.exit_price = exit_price;
        stopped.exit_time = Some(Utc::now());
        stopped.exit_reason = Some(ExitReason::StopOut);
        let stopped = self.persist_outcome(stopped).await?;

        self.trail.lock().await.remove_trail_condition(position_id);
        warn!(position_id = %position_id, exit_price = ?exit_price, "🛑 [EXECUTOR] Stopped out by broker");
        self.ctx.broadcast(&EngineEvent::PositionStopped { position: Box::new(stopped.clone()) });
        self.raise_trigger_actions(&stopped).await;
        Ok(stopped)
    }

    /// Reduces an OPEN position; closes it outright if nothing would remain.
    pub async fn execute_partial_close(
        &self,
        position_id: Uuid,
        close_volume: f64,
        reason: ExitReason,
    ) -> Result<Position, EngineError> {
        let (_claim, position) = self.claim_owned(position_id).await?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::InvalidTransition {
                position_id,
                from: position.status,
                to: PositionStatus::Closing,
            });
        }
        let price = self
            .exit_price(&position)
            .await
            .ok_or_else(|| EngineError::PriceUnavailable(position.symbol.clone()))?;

        let outcome = match self
            .actions
            .execute_partial_close(&position, close_volume, &reason, price, self.ctx.transport.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_close_failure(&position, ExecutionKind::PartialClose, &e).await;
                return Err(e);
            }
        };
        self.record_close(&position, ExecutionKind::PartialClose, &outcome.close).await;

        if outcome.remaining_volume < VOLUME_EPSILON {
            let closing = self.persist_outcome(position.transition(PositionStatus::Closing)?).await?;
            return self.finish_close(&closing, reason, &outcome.close).await;
        }

        let mut reduced = position;
        reduced.volume = outcome.remaining_volume;
        let reduced = self.persist_outcome(reduced).await?;
        info!(
            position_id = %position_id,
            closed = outcome.close.closed_volume,
            remaining = outcome.remaining_volume,
            "✂️ [EXECUTOR] Partial close"
        );
        self.ctx.broadcast(&EngineEvent::PositionReduced {
            position_id,
            closed_volume: outcome.close.closed_volume,
            remaining_volume: outcome.remaining_volume,
        });
        Ok(reduced)
    }

    /// Closes every owned OPEN position in batches. Positions already busy
    /// with another command are left alone; one that cannot be marked CLOSING
    /// is reported failed and stays OPEN.
    pub async fn force_close_all(&self, reason: ExitReason) -> Result<ForceCloseReport, EngineError> {
        let filter = PositionFilter::owned_by(self.ctx.identity.user_id()).with_status(PositionStatus::Open);
        let listed = self.ctx.store.list_positions(&filter).await?;

        let mut claims = Vec::with_capacity(listed.len());
        let mut dispatch = Vec::with_capacity(listed.len());
        let mut closing_by_id = HashMap::with_capacity(listed.len());
        let mut not_dispatched = Vec::new();
        let mut prices = HashMap::new();

        for candidate in listed {
            let (claim, position) = match self.claim_owned(candidate.id).await {
                Ok(claimed) => claimed,
                Err(EngineError::CommandInFlight(_)) => {
                    debug!(position_id = %candidate.id, "[EXECUTOR] Busy — skipped by force close");
                    continue;
                }
                Err(e) => {
                    not_dispatched.push(FailedClose { position_id: candidate.id, error: e.to_string() });
                    continue;
                }
            };
            if position.status != PositionStatus::Open {
                debug!(position_id = %position.id, status = ?position.status, "[EXECUTOR] No longer open — skipped");
                continue;
            }

            let marked = match position.transition(PositionStatus::Closing) {
                Ok(closing) => self.ctx.store.update_position(closing).await.map_err(EngineError::from),
                Err(e) => Err(e),
            };
            match marked {
                Ok(closing) => {
                    if !prices.contains_key(&position.symbol) {
                        if let Some(resolved) = resolve_quote(self.ctx.price_feed.as_ref(), &position.symbol).await {
                            prices.insert(position.symbol.clone(), resolved.quote.mid());
                        }
                    }
                    claims.push(claim);
                    closing_by_id.insert(closing.id, closing);
                    dispatch.push(position);
                }
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "[EXECUTOR] Could not mark CLOSING — not sent");
                    not_dispatched.push(FailedClose { position_id: position.id, error: e.to_string() });
                }
            }
        }

        let mut report = self
            .actions
            .force_close(&dispatch, &reason, &prices, self.ctx.transport.as_ref())
            .await;

        for outcome in &report.closed {
            let Some(closing) = closing_by_id.get(&outcome.position_id) else { continue };
            self.record_close(closing, ExecutionKind::Close, outcome).await;
            if let Err(e) = self.finish_close(closing, reason.clone(), outcome).await {
                error!(position_id = %closing.id, error = %e, "[EXECUTOR] Force-closed but not recorded");
            }
        }
        for failed in &report.failed {
            let Some(closing) = closing_by_id.get(&failed.position_id) else { continue };
            if let Err(e) = self.rollback_close(closing, None).await {
                error!(position_id = %closing.id, error = %e, "[EXECUTOR] Rollback after force close failed");
            }
        }

        drop(claims);
        report.failed.extend(not_dispatched);
        Ok(report)
    }

    /// Manual stop override; mirrored to the EA on a best-effort basis.
    pub async fn update_stop_loss(&self, position_id: Uuid, trigger_price: f64) -> Result<f64, EngineError> {
        let (position, price) = self.open_with_price(position_id).await?;
        let trigger = self.trail.lock().await.update_stop_loss(position_id, trigger_price, price)?;
        self.mirror_stop(&position, trigger).await;
        Ok(trigger)
    }

    /// Volatility-scaled tightening: the stop moves to `width × multiplier`
    /// from the watermark. `None` when that would not tighten it.
    pub async fn adjust_profit_level(&self, position_id: Uuid, width_multiplier: f64) -> Result<Option<f64>, EngineError> {
        let (position, price) = self.open_with_price(position_id).await?;
        let adjusted = self
            .trail
            .lock()
            .await
            .adjust_profit_level(position_id, width_multiplier, price)?;
        if let Some(trigger) = adjusted {
            self.mirror_stop(&position, trigger).await;
        }
        Ok(adjusted)
    }

    async fn open_with_price(&self, position_id: Uuid) -> Result<(Position, f64), EngineError> {
        let position = self.load_owned(position_id).await?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::Validation(format!(
                "position {position_id} is {:?}, stop can only move while OPEN",
                position.status
            )));
        }
        let price = self
            .exit_price(&position)
            .await
            .ok_or_else(|| EngineError::PriceUnavailable(position.symbol.clone()))?;
        Ok((position, price))
    }

    async fn mirror_stop(&self, position: &Position, trigger_price: f64) {
        self.ctx.broadcast(&EngineEvent::TrailRatcheted { position_id: position.id, trigger_price });
        let command = EaCommand::Trail {
            account_id: position.account_id.clone(),
            position_id: position.id,
            trigger_price,
        };
        if let Err(e) = send_with_retry(self.ctx.transport.as_ref(), &command, &self.ctx.config.retry).await {
            warn!(position_id = %position.id, error = %e, "[TRAIL] EA did not take the new stop");
        }
    }

    // ─── Cross-instance actions ───────────────────────────────────────────────

    /// Moves each PENDING action in `triggerActionIds` to EXECUTING.
    /// A CLOSE whose target is already closed goes straight to EXECUTED.
    /// Failures are logged; the close itself stands.
    pub async fn raise_trigger_actions(&self, source: &Position) {
        for &action_id in &source.trigger_action_ids {
            let action = match self.ctx.store.get_action(action_id).await {
                Ok(Some(action)) => action,
                Ok(None) => {
                    warn!(action_id = %action_id, source = %source.id, "[ACTION] Trigger action missing");
                    continue;
                }
                Err(e) => {
                    warn!(action_id = %action_id, error = %e, "[ACTION] Trigger action lookup failed");
                    continue;
                }
            };
            if action.status != ActionStatus::Pending {
                debug!(action_id = %action_id, status = ?action.status, "[ACTION] Already raised");
                continue;
            }

            let mut raised = action;
            raised.trigger_position_id = Some(source.id);
            if raised.action_type == ActionType::Close && self.target_finished(&raised, source).await {
                raised.status = ActionStatus::Executed;
                match self.ctx.store.update_action(raised).await {
                    Ok(done) => debug!(action_id = %done.id, target = %done.position_id, "[ACTION] Target already closed"),
                    Err(e) => warn!(action_id = %action_id, error = %e, "[ACTION] Could not settle"),
                }
                continue;
            }
            raised.status = ActionStatus::Executing;
            match self.ctx.store.update_action(raised).await {
                Ok(raised) => {
                    info!(
                        action_id = %raised.id,
                        owner = %raised.owner_id,
                        target = %raised.position_id,
                        "📤 [ACTION] Raised"
                    );
                    self.ctx.broadcast(&EngineEvent::ActionRaised {
                        action_id: raised.id,
                        owner_id: raised.owner_id.clone(),
                        target_position_id: raised.position_id,
                        action_type: raised.action_type,
                    });
                }
                Err(e) => warn!(action_id = %action_id, error = %e, "[ACTION] Could not raise"),
            }
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    /// The position, if this instance owns it. Reads only.
    pub async fn load_owned(&self, position_id: Uuid) -> Result<Position, EngineError> {
        let position = self
            .ctx
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;
        if !self.ctx.identity.owns(&position) {
            debug!(position_id = %position_id, owner = %position.owner_id, "[EXECUTOR] Not owned — ignoring");
            return Err(EngineError::NotOwned(position_id));
        }
        Ok(position)
    }

    /// Claims `position_id`, then reads it under the claim.
    async fn claim_owned(&self, position_id: Uuid) -> Result<(Claim<'_>, Position), EngineError> {
        let claim = self.claim(position_id)?;
        let position = self.load_owned(position_id).await?;
        Ok((claim, position))
    }

    /// A write that records what the broker already did. Retried on the
    /// transport backoff; when it still fails the position is flagged for
    /// reconciliation.
    async fn persist_outcome(&self, position: Position) -> Result<Position, EngineError> {
        let policy = self.ctx.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.ctx.store.update_position(position.clone()).await {
                Ok(saved) => return Ok(saved),
                Err(e) => e,
            };
            if attempt < max_attempts {
                warn!(position_id = %position.id, attempt, error = %err, "[EXECUTOR] Store write failed — retrying");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                continue;
            }

            error!(
                position_id = %position.id,
                status = ?position.status,
                attempts = attempt,
                error = %err,
                "🚨 [EXECUTOR] Outcome not stored — manual reconciliation required"
            );
            self.ctx.broadcast(&EngineEvent::ReconciliationRequired {
                position_id: position.id,
                attempts: attempt,
                error: err.to_string(),
            });
            return Err(err.into());
        }
    }

    /// True when the action's target is `source` itself or already terminal.
    async fn target_finished(&self, action: &Action, source: &Position) -> bool {
        if action.position_id == source.id {
            return true;
        }
        match self.ctx.store.get_position(action.position_id).await {
            Ok(Some(target)) => target.status.is_terminal(),
            _ => false,
        }
    }

    fn claim(&self, position_id: Uuid) -> Result<Claim<'_>, EngineError> {
        if !lock_ids(&self.in_flight).insert(position_id) {
            return Err(EngineError::CommandInFlight(position_id));
        }
        Ok(Claim { set: &self.in_flight, id: position_id })
    }

    /// Side-aware exit price: bid for BUY, ask for SELL.
    async fn exit_price(&self, position: &Position) -> Option<f64> {
        let resolved = resolve_quote(self.ctx.price_feed.as_ref(), &position.symbol).await?;
        let price = resolved.quote.exit_price(position.side());
        if resolved.is_fallback {
            self.ctx.broadcast(&EngineEvent::PriceFallback { symbol: position.symbol.clone(), price });
        }
        Some(price)
    }

    async fn arm_trail(&self, position: &Position, price: Option<f64>) {
        if !position.has_trail() {
            return;
        }
        let price = match price {
            Some(p) => Some(p),
            None => self.exit_price(position).await,
        };
        let mut trail = self.trail.lock().await;
        let Some(price) = price else {
            trail.remove_trail_condition(position.id);
            warn!(position_id = %position.id, "[TRAIL] No price — trail not armed");
            return;
        };
        if let Err(e) = trail.initialize_trail_condition(position, price) {
            warn!(position_id = %position.id, error = %e, "[TRAIL] Could not arm");
        }
    }

    async fn cancel_position(
        &self,
        position: &Position,
        reason: ExitReason,
        error: Option<String>,
    ) -> Result<Position, EngineError> {
        let mut canceled = position.transition(PositionStatus::Canceled)?;
        canceled.exit_time = Some(Utc::now());
        canceled.exit_reason = Some(reason.clone());
        let canceled = self.persist_outcome(canceled).await?;

        self.trail.lock().await.remove_trail_condition(position.id);
        info!(position_id = %position.id, reason = %reason, error = ?error, "🚫 [EXECUTOR] Position canceled");
        self.ctx.broadcast(&EngineEvent::PositionCanceled { position_id: position.id, reason, error });
        Ok(canceled)
    }

    async fn record_close(&self, position: &Position, kind: ExecutionKind, outcome: &CloseOutcome) {
        self.actions
            .record_execution_result(
                position,
                kind,
                outcome.execution_time,
                true,
                Some(outcome.close_price),
                None,
                outcome.retry_count,
            )
            .await;
    }

    async fn record_close_failure(&self, position: &Position, kind: ExecutionKind, error: &EngineError) {
        self.actions
            .record_execution_result(
                position,
                kind,
                Duration::ZERO,
                false,
                None,
                Some(error.to_string()),
                error.attempts().saturating_sub(1),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::engine::retry::RetryPolicy;
    use crate::hedge::link_hedge_pair;
    use crate::metrics::InMemoryMetrics;
    use crate::models::ExecutionType;
    use crate::price_feed::TickPriceFeed;
    use crate::store::testing::FlakyStore;
    use crate::store::{InMemoryStore, TradeStore};
    use crate::transport::testing::{ScriptedTransport, Step};

    struct Harness {
        store: Arc<InMemoryStore>,
        transport: Arc<ScriptedTransport>,
        feed: Arc<TickPriceFeed>,
        metrics: Arc<InMemoryMetrics>,
        executor: PositionExecutor,
    }

    fn harness_on(user: &str, store: Arc<InMemoryStore>, transport: ScriptedTransport) -> Harness {
        harness_backed(user, store.clone(), store, transport)
    }

    /// `store` is what the test inspects; the executor writes through `backend`.
    fn harness_backed(
        user: &str,
        store: Arc<InMemoryStore>,
        backend: Arc<dyn TradeStore>,
        transport: ScriptedTransport,
    ) -> Harness {
        let mut config = NodeConfig::for_instance(user);
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        config.force_close.batch_pause = Duration::from_millis(1);

        let transport = Arc::new(transport);
        let feed = Arc::new(TickPriceFeed::new());
        let metrics = Arc::new(InMemoryMetrics::new(100));
        let ctx = Arc::new(EngineContext::new(
            config,
            backend,
            transport.clone(),
            feed.clone(),
            metrics.clone(),
        ));
        Harness { store, transport, feed, metrics, executor: PositionExecutor::new(ctx) }
    }

    fn harness(user: &str, transport: ScriptedTransport) -> Harness {
        harness_on(user, Arc::new(InMemoryStore::new()), transport)
    }

    fn tick(symbol: &str, bid: f64, ask: f64) -> TickData {
        TickData { symbol: symbol.into(), bid, ask, liquidity: None, time: Utc::now(), account_id: None }
    }

    impl Harness {
        async fn price(&self, price: f64) -> TickData {
            let t = tick("EURUSD", price, price);
            self.feed.record(&t).await;
            t
        }

        async fn pending(&self, owner: &str, trail_width: f64) -> Position {
            let p = Position::new(owner, "acc-1", "EURUSD", 0.10, ExecutionType::Entry, trail_width);
            self.store.create_position(p).await.unwrap()
        }

        /// An OPEN position already in the store, trail armed via the event path.
        async fn open(&self, owner: &str, trail_width: f64) -> Position {
            let mut p = Position::new(owner, "acc-1", "EURUSD", 0.10, ExecutionType::Entry, trail_width);
            p.status = PositionStatus::Open;
            p.entry_price = Some(1.1000);
            let p = self.store.create_position(p).await.unwrap();
            self.executor.on_position_event(&p).await;
            p
        }

        async fn status(&self, id: Uuid) -> PositionStatus {
            self.store.get_position(id).await.unwrap().unwrap().status
        }

        fn events(&self) -> tokio::sync::broadcast::Receiver<String> {
            self.executor.ctx.events_tx.subscribe()
        }
    }

    fn drained(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_trail_scenario_closes_exactly_once() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.pending("user-a", 0.0010).await;

        let open = h.executor.execute_entry(p.id).await.unwrap();
        assert_eq!(open.status, PositionStatus::Open);
        assert_eq!(open.entry_price, Some(1.1000));

        let t = h.price(1.1005).await;
        assert!(h.executor.on_price_tick(&t).await.is_empty());
        let c = h.executor.trail_snapshot(p.id).await.unwrap();
        assert!((c.trigger_price - 1.0995).abs() < 1e-9);

        let t = h.price(1.1010).await;
        assert!(h.executor.on_price_tick(&t).await.is_empty());
        let c = h.executor.trail_snapshot(p.id).await.unwrap();
        assert!((c.trigger_price - 1.1000).abs() < 1e-9);

        let t = h.price(1.0999).await;
        assert_eq!(h.executor.on_price_tick(&t).await, vec![p.id]);

        let t = h.price(1.0990).await;
        assert!(h.executor.on_price_tick(&t).await.is_empty());

        assert_eq!(h.transport.closes_for(p.id), 1);
        let closed = h.store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::TrailStop));
        assert_eq!(closed.exit_price, Some(1.0999));
        assert_eq!(h.executor.trailed_positions().await, 0);
    }

    #[tokio::test]
    async fn test_trail_only_closes_triggered_position() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let tight = h.open("user-a", 0.0005).await;
        let loose = h.open("user-a", 0.0050).await;

        let t = h.price(1.0994).await;
        assert_eq!(h.executor.on_price_tick(&t).await, vec![tight.id]);
        assert_eq!(h.transport.closes_for(tight.id), 1);
        assert_eq!(h.transport.closes_for(loose.id), 0);
        assert_eq!(h.status(loose.id).await, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_ownership_filter_has_no_side_effects() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;

        let mut foreign = Position::new("user-b", "acc-9", "EURUSD", 0.10, ExecutionType::Entry, 0.0010);
        foreign.status = PositionStatus::Open;
        let foreign = h.store.create_position(foreign).await.unwrap();
        let foreign_pending = h.pending("user-b", 0.0).await;
        let mut action = Action::new("user-b", foreign.id, ActionType::Close);
        action.status = ActionStatus::Executing;
        let action = h.store.create_action(action).await.unwrap();

        let writes_before = h.store.write_count();

        h.executor.on_position_event(&foreign).await;
        h.executor.on_action_event(&action).await;
        assert!(matches!(
            h.executor.execute_close(foreign.id, ExitReason::Manual).await,
            Err(EngineError::NotOwned(_))
        ));
        assert!(matches!(h.executor.execute_entry(foreign_pending.id).await, Err(EngineError::NotOwned(_))));
        assert!(matches!(h.executor.cancel_pending(foreign_pending.id).await, Err(EngineError::NotOwned(_))));
        assert!(matches!(h.executor.apply_stop_out(foreign.id, None).await, Err(EngineError::NotOwned(_))));
        let report = h.executor.force_close_all(ExitReason::ForceClose).await.unwrap();
        assert!(report.closed.is_empty() && report.failed.is_empty());

        assert_eq!(h.store.write_count(), writes_before);
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.executor.trailed_positions().await, 0);
    }

    #[tokio::test]
    async fn test_entry_gate_refusal_cancels_without_order() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.feed.record(&tick("EURUSD", 1.1000, 1.1010)).await;
        let p = h.pending("user-a", 0.0010).await;

        let canceled = h.executor.execute_entry(p.id).await.unwrap();
        assert_eq!(canceled.status, PositionStatus::Canceled);
        assert_eq!(canceled.exit_reason, Some(ExitReason::EntryRejected));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_entry_rejection_cancels() {
        let h = harness("user-a", ScriptedTransport::repeating(Step::Reject("not enough money")));
        h.price(1.1000).await;
        let p = h.pending("user-a", 0.0010).await;

        let err = h.executor.execute_entry(p.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
        assert_eq!(h.status(p.id).await, PositionStatus::Canceled);
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.metrics.summary().await.failed, 1);
    }

    #[tokio::test]
    async fn test_close_rejection_rolls_back_and_rearms_trail() {
        let h = harness("user-a", ScriptedTransport::new(vec![Step::Reject("market closed")]));
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0010).await;

        let t = h.price(1.0989).await;
        assert_eq!(h.executor.on_price_tick(&t).await, vec![p.id]);

        assert_eq!(h.status(p.id).await, PositionStatus::Open);
        let c = h.executor.trail_snapshot(p.id).await.unwrap();
        assert!(!c.is_triggered);
        assert!((c.trigger_price - 1.0979).abs() < 1e-9);

        // second attempt fills
        let t = h.price(1.0978).await;
        assert_eq!(h.executor.on_price_tick(&t).await, vec![p.id]);
        assert_eq!(h.status(p.id).await, PositionStatus::Closed);
        assert_eq!(h.transport.closes_for(p.id), 2);
    }

    #[tokio::test]
    async fn test_exhausted_close_is_left_unresolved() {
        let h = harness("user-a", ScriptedTransport::repeating(Step::Fail("timeout")));
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let err = h.executor.execute_close(p.id, ExitReason::Manual).await.unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { attempts: 12, .. }));
        // 3 transport attempts × (1 + 3 supervisory rounds)
        assert_eq!(h.transport.calls(), 12);

        let after = h.store.get_position(p.id).await.unwrap().unwrap();
        assert_eq!(after.status, PositionStatus::Canceled);
        assert_eq!(after.exit_reason, Some(ExitReason::Unresolved));
    }

    #[tokio::test]
    async fn test_supervisory_round_recovers() {
        let h = harness(
            "user-a",
            ScriptedTransport::new(vec![Step::Fail("network down"), Step::Fail("timeout"), Step::Fail("timeout")]),
        );
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let closed = h.executor.execute_close(p.id, ExitReason::Manual).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(h.transport.calls(), 4);
        assert_eq!(h.metrics.summary().await.total_retries, 3);
    }

    #[tokio::test]
    async fn test_second_close_while_in_flight_is_refused() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let _claim = h.executor.claim(p.id).unwrap();
        assert!(matches!(
            h.executor.execute_partial_close(p.id, 0.05, ExitReason::PartialClose).await,
            Err(EngineError::CommandInFlight(_))
        ));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        let p = h.pending("user-a", 0.0).await;

        let _claim = h.executor.claim(p.id).unwrap();
        assert!(matches!(h.executor.cancel_pending(p.id).await, Err(EngineError::CommandInFlight(_))));
        drop(_claim);

        let canceled = h.executor.cancel_pending(p.id).await.unwrap();
        assert_eq!(canceled.status, PositionStatus::Canceled);
        assert_eq!(canceled.exit_reason, Some(ExitReason::Withdrawn));
        assert!(matches!(h.executor.cancel_pending(p.id).await, Err(EngineError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_partial_close_then_remainder() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let reduced = h.executor.execute_partial_close(p.id, 0.04, ExitReason::PartialClose).await.unwrap();
        assert_eq!(reduced.status, PositionStatus::Open);
        assert!((reduced.volume - 0.06).abs() < 1e-9);

        let closed = h
            .executor
            .execute_partial_close(p.id, reduced.volume, ExitReason::PartialClose)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(h.transport.closes_for(p.id), 2);
    }

    #[tokio::test]
    async fn test_force_close_all_only_touches_owned_open() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let mine: Vec<Position> = futures_util::future::join_all((0..3).map(|_| h.open("user-a", 0.0010))).await;
        let theirs = h.open("user-b", 0.0010).await;
        let pending = h.pending("user-a", 0.0).await;

        let report = h.executor.force_close_all(ExitReason::ForceClose).await.unwrap();
        assert_eq!(report.closed.len(), 3);
        assert!(report.failed.is_empty());
        for p in &mine {
            assert_eq!(h.status(p.id).await, PositionStatus::Closed);
        }
        assert_eq!(h.status(theirs.id).await, PositionStatus::Open);
        assert_eq!(h.status(pending.id).await, PositionStatus::Pending);
    }

    #[tokio::test]
    async fn test_force_close_failures_roll_back() {
        let h = harness("user-a", ScriptedTransport::repeating(Step::Reject("trade disabled")));
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let report = h.executor.force_close_all(ExitReason::ForceClose).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(h.status(p.id).await, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_stop_out_bypasses_closing() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0010).await;

        let stopped = h.executor.apply_stop_out(p.id, Some(1.0950)).await.unwrap();
        assert_eq!(stopped.status, PositionStatus::Stopped);
        assert_eq!(stopped.exit_price, Some(1.0950));
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.executor.trailed_positions().await, 0);
    }

    #[tokio::test]
    async fn test_update_stop_loss_mirrors_to_ea() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0010).await;

        assert_eq!(h.executor.update_stop_loss(p.id, 1.0995).await.unwrap(), 1.0995);
        assert!(matches!(h.transport.sent()[0], EaCommand::Trail { .. }));
        assert!(matches!(
            h.executor.update_stop_loss(p.id, 1.1005).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_action_is_failed() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        let p = h.pending("user-a", 0.0).await;
        let mut action = Action::new("user-a", p.id, ActionType::Unknown);
        action.status = ActionStatus::Executing;
        let action = h.store.create_action(action).await.unwrap();

        h.executor.on_action_event(&action).await;
        let after = h.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(after.status, ActionStatus::Failed);
        assert_eq!(h.transport.calls(), 0);
        assert!(lock_ids(&h.executor.consumed_actions).is_empty());
    }

    #[tokio::test]
    async fn test_consumed_action_is_forgotten_once_terminal() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;
        let mut action = Action::new("user-a", p.id, ActionType::Close);
        action.status = ActionStatus::Executing;
        let action = h.store.create_action(action).await.unwrap();

        lock_ids(&h.executor.consumed_actions).insert(action.id);
        let mut done = action.clone();
        done.status = ActionStatus::Executed;
        h.executor.on_action_event(&done).await;
        assert!(lock_ids(&h.executor.consumed_actions).is_empty());

        // the stale EXECUTING copy no longer matches the record
        h.store.update_action(done).await.unwrap();
        h.executor.on_action_event(&action).await;
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.status(p.id).await, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_close_action_on_closed_target_is_executed() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        let mut p = Position::new("user-a", "acc-1", "EURUSD", 0.10, ExecutionType::Entry, 0.0);
        p.status = PositionStatus::Closed;
        let p = h.store.create_position(p).await.unwrap();
        let mut action = Action::new("user-a", p.id, ActionType::Close);
        action.status = ActionStatus::Executing;
        let action = h.store.create_action(action).await.unwrap();

        h.executor.on_action_event(&action).await;
        let after = h.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(after.status, ActionStatus::Executed);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_cross_instance_close_via_action() {
        let store = Arc::new(InMemoryStore::new());
        let a = harness_on("user-a", store.clone(), ScriptedTransport::always_fill());
        let b = harness_on("user-b", store.clone(), ScriptedTransport::always_fill());
        a.price(1.1000).await;
        b.price(1.1000).await;

        let leg_a = a.open("user-a", 0.0).await;
        let mut leg_b = Position::new("user-b", "acc-2", "EURUSD", 0.10, ExecutionType::Exit, 0.0);
        leg_b.status = PositionStatus::Open;
        leg_b.entry_price = Some(1.1000);
        let leg_b = store.create_position(leg_b).await.unwrap();

        let (leg_a, _) = link_hedge_pair(store.as_ref(), &leg_a, &leg_b).await.unwrap();
        let close_b_id = leg_a.trigger_action_ids[0];

        a.executor.execute_close(leg_a.id, ExitReason::Manual).await.unwrap();
        let raised = store.get_action(close_b_id).await.unwrap().unwrap();
        assert_eq!(raised.status, ActionStatus::Executing);
        assert_eq!(raised.trigger_position_id, Some(leg_a.id));
        assert_eq!(raised.position_id, leg_b.id);

        // every instance sees the action; only its owner acts
        a.executor.on_action_event(&raised).await;
        assert_eq!(a.transport.closes_for(leg_b.id), 0);
        b.executor.on_action_event(&raised).await;
        b.executor.on_action_event(&raised).await;

        assert_eq!(b.transport.closes_for(leg_b.id), 1);
        let closed_b = store.get_position(leg_b.id).await.unwrap().unwrap();
        assert_eq!(closed_b.status, PositionStatus::Closed);
        assert_eq!(closed_b.exit_reason, Some(ExitReason::ActionTriggered));
        let done = store.get_action(close_b_id).await.unwrap().unwrap();
        assert_eq!(done.status, ActionStatus::Executed);

        // closing B settles the back-link to the already closed A
        let close_a_id = closed_b.trigger_action_ids[0];
        let back_link = store.get_action(close_a_id).await.unwrap().unwrap();
        assert_eq!(back_link.status, ActionStatus::Executed);
        a.executor.on_action_event(&back_link).await;
        assert_eq!(a.transport.closes_for(leg_a.id), 1);

        let actions = store.list_actions(&Default::default()).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|x| x.status == ActionStatus::Executed));
    }

    #[tokio::test]
    async fn test_force_close_store_failure_strands_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let flaky = Arc::new(FlakyStore::failing_update(store.clone(), 3));
        let h = harness_backed("user-a", store, flaky, ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(h.open("user-a", 0.0).await.id);
        }

        let report = h.executor.force_close_all(ExitReason::ForceClose).await.unwrap();
        assert_eq!(report.closed.len(), 3);
        assert_eq!(report.failed.len(), 1);

        let mut statuses = Vec::new();
        for id in &ids {
            statuses.push(h.status(*id).await);
        }
        assert!(!statuses.contains(&PositionStatus::Closing));
        assert_eq!(statuses.iter().filter(|s| **s == PositionStatus::Closed).count(), 3);
        let left_open = report.failed[0].position_id;
        assert_eq!(h.status(left_open).await, PositionStatus::Open);
        assert_eq!(h.transport.closes_for(left_open), 0);

        // and it can still be closed afterwards
        let closed = h.executor.execute_close(left_open, ExitReason::Manual).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_outcome_write_is_retried() {
        let store = Arc::new(InMemoryStore::new());
        let flaky = Arc::new(FlakyStore::failing_update(store.clone(), 2));
        let h = harness_backed("user-a", store, flaky, ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let closed = h.executor.execute_close(p.id, ExitReason::Manual).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(h.status(p.id).await, PositionStatus::Closed);
        assert_eq!(h.transport.closes_for(p.id), 1);
    }

    #[tokio::test]
    async fn test_lost_close_outcome_requires_reconciliation() {
        let store = Arc::new(InMemoryStore::new());
        let flaky = Arc::new(FlakyStore::failing_from(store.clone(), 2));
        let h = harness_backed("user-a", store, flaky, ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0010).await;
        let mut events = h.events();

        let err = h.executor.execute_close(p.id, ExitReason::Manual).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(h.transport.closes_for(p.id), 1);
        assert_eq!(h.executor.trailed_positions().await, 0);
        assert!(drained(&mut events).iter().any(|e| e.contains("RECONCILIATION_REQUIRED")));
    }

    #[tokio::test]
    async fn test_stale_caller_rereads_under_claim() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;

        let claim = h.executor.claim(p.id).unwrap();
        assert!(matches!(
            h.executor.execute_close(p.id, ExitReason::Manual).await,
            Err(EngineError::CommandInFlight(_))
        ));
        // the holder finishes its close before letting go
        let mut closed = h.store.get_position(p.id).await.unwrap().unwrap();
        closed.status = PositionStatus::Closed;
        h.store.update_position(closed).await.unwrap();
        drop(claim);

        assert!(matches!(
            h.executor.execute_close(p.id, ExitReason::Manual).await,
            Err(EngineError::InvalidTransition { from: PositionStatus::Closed, .. })
        ));
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.status(p.id).await, PositionStatus::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closes_send_one_command() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0).await;
        let Harness { executor, transport, store, .. } = h;
        let executor = Arc::new(executor);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move { executor.execute_close(p.id, ExitReason::Manual).await })
            })
            .collect();
        let results: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            EngineError::CommandInFlight(_) | EngineError::InvalidTransition { .. }
        )));
        assert_eq!(transport.closes_for(p.id), 1);
        assert_eq!(store.get_position(p.id).await.unwrap().unwrap().status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_entry_held_while_ea_link_silent() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.pending("user-a", 0.0010).await;
        let long_ago = Utc::now() - chrono::Duration::seconds(600);
        h.executor.ctx.ea_links.touch("acc-1", Some(10.0), None, long_ago).await;

        let err = h.executor.execute_entry(p.id).await.unwrap_err();
        assert!(matches!(err, EngineError::EaOffline { .. }));
        assert_eq!(h.status(p.id).await, PositionStatus::Pending);
        assert_eq!(h.transport.calls(), 0);

        h.executor.ctx.ea_links.touch("acc-1", Some(10.0), None, Utc::now()).await;
        let open = h.executor.execute_entry(p.id).await.unwrap();
        assert_eq!(open.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_entry_on_fallback_prices_is_refused() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        let p = h.pending("user-a", 0.0010).await;

        let canceled = h.executor.execute_entry(p.id).await.unwrap();
        assert_eq!(canceled.status, PositionStatus::Canceled);
        assert_eq!(canceled.exit_reason, Some(ExitReason::EntryRejected));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_adjust_profit_level_tightens_and_mirrors() {
        let h = harness("user-a", ScriptedTransport::always_fill());
        h.price(1.1000).await;
        let p = h.open("user-a", 0.0010).await;

        let tightened = h.executor.adjust_profit_level(p.id, 0.5).await.unwrap().unwrap();
        assert!((tightened - 1.0995).abs() < 1e-9);
        assert!(matches!(h.transport.sent()[0], EaCommand::Trail { .. }));

        assert_eq!(h.executor.adjust_profit_level(p.id, 2.0).await.unwrap(), None);
        assert_eq!(h.transport.calls(), 1);
        assert!(matches!(
            h.executor.adjust_profit_level(p.id, 0.0).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_run_loop_picks_up_raised_action() {
        let store = Arc::new(InMemoryStore::new());
        let b = harness_on("user-b", store.clone(), ScriptedTransport::always_fill());
        b.price(1.1000).await;
        let Harness { executor, transport, .. } = b;
        let executor = Arc::new(executor);
        tokio::spawn(executor.clone().run());
        tokio::task::yield_now().await;

        let mut target = Position::new("user-b", "acc-2", "EURUSD", 0.10, ExecutionType::Exit, 0.0);
        target.status = PositionStatus::Open;
        target.entry_price = Some(1.1000);
        let target = store.create_position(target).await.unwrap();
        let mut action = Action::new("user-b", target.id, ActionType::Close);
        action.status = ActionStatus::Executing;
        store.create_action(action).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let p = store.get_position(target.id).await.unwrap().unwrap();
                if p.status == PositionStatus::Closed {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::ActionTriggered));
        assert_eq!(transport.closes_for(target.id), 1);
    }
}
