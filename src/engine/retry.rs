//! # engine::retry
//!
//! Bounded retry with exponential backoff for EA bridge commands.
//!
//! | Retried                       | Not retried                      |
//! |-------------------------------|----------------------------------|
//! | network errors                | broker rejection (bad volume...) |
//! | timeouts                      | validation failures              |
//! | connection reset              | anything else                    |
//!
//! Delay before attempt `n + 1` is `min(base · 2^(n-1), max)`, so the
//! default policy waits 1 s then 2 s across its three attempts.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::transport::{CommandAck, CommandTransport, EaCommand};

/// Substrings that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "connection refused",
    "unreachable",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// True if `message` looks like a network-level failure worth retrying.
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// A command the EA acknowledged, plus what it took to get there.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub ack: CommandAck,
    /// Failed attempts before the successful one.
    pub retry_count: u32,
    pub elapsed: Duration,
}

/// Sends `command`, retrying transient failures per `policy`.
///
/// Non-transient failures return `EngineError::Execution` straight away;
/// transient ones that hit the cap return `EngineError::RetriesExhausted`.
pub async fn send_with_retry(
    transport: &dyn CommandTransport,
    command: &EaCommand,
    policy: &RetryPolicy,
) -> Result<Delivered, EngineError> {
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match transport.send(command).await {
            Ok(ack) if ack.success => {
                return Ok(Delivered {
                    ack,
                    retry_count: attempt - 1,
                    elapsed: started.elapsed(),
                });
            }
            Ok(ack) => ack.error.unwrap_or_else(|| "EA rejected command".to_string()),
            Err(e) => e.to_string(),
        };

        if !is_transient(&failure) {
            warn!(
                position_id = %command.position_id(),
                kind = command.kind(),
                attempt,
                error = %failure,
                "[TRANSPORT] Command rejected — not retrying"
            );
            return Err(EngineError::Execution(failure));
        }

        if attempt >= max_attempts {
            warn!(
                position_id = %command.position_id(),
                kind = command.kind(),
                attempts = attempt,
                error = %failure,
                "[TRANSPORT] Retry budget exhausted"
            );
            return Err(EngineError::RetriesExhausted {
                attempts: attempt,
                last_error: failure,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(
            position_id = %command.position_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "[TRANSPORT] Transient failure — backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
