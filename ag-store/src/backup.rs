use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_BACKUP_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Snapshot of a file's content taken before a mutation.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
}

/// One live snapshot per path; a newer snapshot replaces the older one.
pub(crate) struct BackupMap {
    entries: Mutex<HashMap<PathBuf, Backup>>,
}

impl BackupMap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, path: PathBuf, content: String) {
        let backup = Backup {
            size_bytes: content.len() as u64,
            content,
            timestamp: Utc::now(),
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path, backup);
        }
    }

    pub(crate) fn get(&self, path: &Path) -> Option<Backup> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(path).cloned())
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(path))
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.entries
            .lock()
            .map(|entries| entries.values().map(|b| b.size_bytes).sum())
            .unwrap_or(0)
    }
}
