//! # metrics: execution outcome sink
//!
//! Fire-and-forget recording of every open/close attempt. A failing sink must
//! never change a trading decision: callers go through
//! `ActionFlowEngine::record_execution_result`, which only logs sink errors.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ExecutionType;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Which command the record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionKind {
    Open,
    Close,
    PartialClose,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub position_id: Uuid,
    pub execution_type: ExecutionType,
    pub kind: ExecutionKind,
    #[serde(serialize_with = "serialize_millis")]
    pub execution_time: Duration,
    pub success: bool,
    pub final_price: Option<f64>,
    pub profit: Option<f64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub recorded_at: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_execution_result(&self, record: &ExecutionRecord) -> Result<(), MetricsError>;
}

/// Sends `record` to `sink`, logging (never returning) any failure.
pub async fn record_quietly(sink: &dyn MetricsSink, record: &ExecutionRecord) {
    if let Err(e) = sink.record_execution_result(record).await {
        warn!(
            position_id = %record.position_id,
            error = %e,
            "⚠️ execution metrics dropped"
        );
    }
}

// ─── InMemoryMetrics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_retries: u64,
    pub avg_execution_ms: f64,
}

#[derive(Default)]
struct MetricsInner {
    history: VecDeque<ExecutionRecord>,
    summary: MetricsSummary,
    total_ms: f64,
}

/// Keeps the last `capacity` records plus running totals for the monitor.
pub struct InMemoryMetrics {
    capacity: usize,
    inner: RwLock<MetricsInner>,
}

impl InMemoryMetrics {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: RwLock::new(MetricsInner::default()) }
    }

    pub async fn summary(&self) -> MetricsSummary {
        self.inner.read().await.summary.clone()
    }

    /// Most recent first.
    pub async fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.read().await;
        inner.history.iter().rev().take(limit).cloned().collect()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn record_execution_result(&self, record: &ExecutionRecord) -> Result<(), MetricsError> {
        info!(
            position_id = %record.position_id,
            kind = ?record.kind,
            success = record.success,
            execution_ms = record.execution_time.as_millis() as u64,
            retry_count = record.retry_count,
            final_price = ?record.final_price,
            error = ?record.error_message,
            "📊 execution recorded"
        );

        let mut inner = self.inner.write().await;
        if inner.history.len() >= self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record.clone());

        let ms = record.execution_time.as_secs_f64() * 1_000.0;
        inner.total_ms += ms;
        let s = &mut inner.summary;
        s.total += 1;
        if record.success {
            s.succeeded += 1;
        } else {
            s.failed += 1;
        }
        s.total_retries += u64::from(record.retry_count);
        let total = s.total as f64;
        inner.summary.avg_execution_ms = inner.total_ms / total;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// A sink that always errors.
    pub struct BrokenSink;

    #[async_trait]
    impl MetricsSink for BrokenSink {
        async fn record_execution_result(&self, _: &ExecutionRecord) -> Result<(), MetricsError> {
            Err(MetricsError::Unavailable("sink offline".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(success: bool, ms: u64, retries: u32) -> ExecutionRecord {
        ExecutionRecord {
            position_id: Uuid::new_v4(),
            execution_type: ExecutionType::Entry,
            kind: ExecutionKind::Open,
            execution_time: Duration::from_millis(ms),
            success,
            final_price: None,
            profit: None,
            error_message: None,
            retry_count: retries,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_summary_and_bounded_history() {
        let metrics = InMemoryMetrics::new(2);
        metrics.record_execution_result(&record(true, 10, 0)).await.unwrap();
        metrics.record_execution_result(&record(false, 30, 2)).await.unwrap();
        metrics.record_execution_result(&record(true, 20, 1)).await.unwrap();

        let s = metrics.summary().await;
        assert_eq!(s.total, 3);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.total_retries, 3);
        assert!((s.avg_execution_ms - 20.0).abs() < 1e-6);
        assert_eq!(metrics.recent(10).await.len(), 2);
    }
}
