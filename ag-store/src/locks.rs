use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes mutations per path. Multi-path callers lock in sorted order, so two
/// operations over overlapping path sets cannot deadlock.
#[derive(Default)]
pub(crate) struct PathLocks {
    table: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

pub(crate) struct PathGuard {
    table: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
    paths: Vec<PathBuf>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl PathLocks {
    pub(crate) async fn acquire(&self, paths: impl IntoIterator<Item = PathBuf>) -> PathGuard {
        let mut paths: Vec<PathBuf> = paths.into_iter().collect();
        paths.sort();
        paths.dedup();

        let mut guards = Vec::with_capacity(paths.len());
        for path in &paths {
            let lock = self
                .table
                .entry(path.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        PathGuard {
            table: self.table.clone(),
            paths,
            guards,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.len()
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.guards.clear();
        for path in &self.paths {
            self.table
                .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}
