use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Edit,
    Delete,
    Copy,
    Move,
    Batch,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub file_paths: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub backup_created: bool,
    pub status: OperationStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_operations: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
    pub backups: usize,
    pub backup_bytes: u64,
    pub by_kind: BTreeMap<String, usize>,
}

struct LedgerState {
    active: HashMap<Uuid, Operation>,
    history: VecDeque<Operation>,
}

/// Operations in flight plus a bounded FIFO history of finished ones.
pub(crate) struct OperationLedger {
    state: Mutex<LedgerState>,
    capacity: usize,
}

impl OperationLedger {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                active: HashMap::new(),
                history: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn begin(&self, kind: OperationKind, file_paths: Vec<PathBuf>) -> Uuid {
        let op = Operation {
            id: Uuid::new_v4(),
            kind,
            file_paths,
            timestamp: Utc::now(),
            backup_created: false,
            status: OperationStatus::Active,
            error: None,
        };
        let id = op.id;
        if let Ok(mut state) = self.state.lock() {
            state.active.insert(id, op);
        }
        id
    }

    pub(crate) fn mark_backup(&self, id: Uuid, backup_created: bool) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(op) = state.active.get_mut(&id) {
                op.backup_created = backup_created;
            }
        }
    }

    pub(crate) fn complete(&self, id: Uuid) {
        self.finish(id, OperationStatus::Completed, None);
    }

    pub(crate) fn fail(&self, id: Uuid, error: impl Into<String>) {
        self.finish(id, OperationStatus::Failed, Some(error.into()));
    }

    fn finish(&self, id: Uuid, status: OperationStatus, error: Option<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(mut op) = state.active.remove(&id) else {
            return;
        };
        op.status = status;
        op.error = error;
        state.history.push_back(op);
        while state.history.len() > self.capacity {
            state.history.pop_front();
        }
    }

    /// Finished operations, most recent first.
    pub(crate) fn history(&self, limit: usize) -> Vec<Operation> {
        self.state
            .lock()
            .map(|state| state.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let Ok(state) = self.state.lock() else {
            return StoreStats::default();
        };
        let mut stats = StoreStats {
            total_operations: state.history.len(),
            active: state.active.len(),
            ..StoreStats::default()
        };
        for op in &state.history {
            match op.status {
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Active => {}
            }
            *stats.by_kind.entry(op.kind.as_str().to_string()).or_insert(0) += 1;
        }
        stats
    }
}
