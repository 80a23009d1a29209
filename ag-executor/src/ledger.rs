use crate::capability::{Capability, ExecutionContext, ExecutionResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_EXECUTION_HISTORY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub capability: Capability,
    pub result: ExecutionResult,
    pub context_snapshot: ExecutionContext,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub pending_approvals: usize,
    pub recent: Vec<ExecutionRecord>,
}

/// Ring buffer of execution records, oldest evicted first.
pub(crate) struct ExecutionLedger {
    records: Mutex<VecDeque<ExecutionRecord>>,
    capacity: usize,
}

impl ExecutionLedger {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub(crate) fn append(&self, record: ExecutionRecord) {
        let Ok(mut records) = self.records.lock() else {
            tracing::error!(record_id = %record.id, "execution ledger lock poisoned, record dropped");
            return;
        };
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    pub(crate) fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn stats(&self, pending_approvals: usize, recent: usize) -> ExecutorStats {
        let (total, successful) = self
            .records
            .lock()
            .map(|records| (records.len(), records.iter().filter(|r| r.success).count()))
            .unwrap_or((0, 0));
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };
        ExecutorStats {
            total,
            successful,
            failed: total - successful,
            success_rate,
            pending_approvals,
            recent: self.history(recent),
        }
    }
}
