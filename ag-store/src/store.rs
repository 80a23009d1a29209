use crate::backup::{Backup, BackupMap, DEFAULT_BACKUP_MAX_BYTES};
use crate::error::{Result, StoreError};
use crate::fs::{FileChange, WorkspaceEdit, WorkspaceFs, workspace_key};
use crate::ledger::{
    DEFAULT_HISTORY_CAPACITY, Operation, OperationKind, OperationLedger, StoreStats,
};
use crate::locks::PathLocks;
use crate::text_edit::{TextEdit, apply_edits};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Files larger than this are mutated without a backup.
    pub backup_max_bytes: u64,
    pub history_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup_max_bytes: DEFAULT_BACKUP_MAX_BYTES,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub overwrite: bool,
    /// Snapshot the file being overwritten. Ignored for new files.
    pub create_backup: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            create_backup: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EditOptions {
    pub create_backup: bool,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteOptions {
    pub create_backup: bool,
    pub recursive: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            recursive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MoveOptions {
    pub overwrite: bool,
    pub create_backup: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            create_backup: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub create_backup: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub paths: Vec<PathBuf>,
    /// False means no safety net exists for this mutation.
    pub backup_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Create {
        path: PathBuf,
        content: String,
        #[serde(default)]
        overwrite: bool,
    },
    Edit {
        path: PathBuf,
        edits: Vec<TextEdit>,
    },
    Delete {
        path: PathBuf,
        #[serde(default)]
        recursive: bool,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[serde(default)]
        overwrite: bool,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
        #[serde(default)]
        overwrite: bool,
    },
}

impl BatchOp {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Edit { .. } => OperationKind::Edit,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Copy { .. } => OperationKind::Copy,
            Self::Move { .. } => OperationKind::Move,
        }
    }

    fn raw_paths(&self) -> Vec<&Path> {
        match self {
            Self::Create { path, .. } | Self::Edit { path, .. } | Self::Delete { path, .. } => {
                vec![path.as_path()]
            }
            Self::Copy { from, to, .. } | Self::Move { from, to, .. } => {
                vec![from.as_path(), to.as_path()]
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOpResult {
    pub index: usize,
    pub kind: OperationKind,
    pub paths: Vec<PathBuf>,
    /// True only when the change is on disk once the batch returns.
    pub success: bool,
    pub error: Option<String>,
    /// Some path of this operation was restored from backup after the batch failed.
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub operation_id: Uuid,
    pub success: bool,
    /// Whether the combined edit reached the file system.
    pub applied: bool,
    pub results: Vec<BatchOpResult>,
    pub backed_up: Vec<PathBuf>,
    /// Present when something failed and a restore was attempted.
    pub rollback: Option<RollbackReport>,
}

struct BatchPlan {
    changes: Vec<FileChange>,
    backup_paths: Vec<PathBuf>,
}

/// Workspace mutations with pre-mutation backups, best-effort rollback and an
/// operation ledger.
///
/// Backups are in-memory, one per path, and skipped above the size ceiling. Mutations
/// touching the same path are serialized.
pub struct AtomicFileStore {
    fs: Arc<dyn WorkspaceFs>,
    backups: BackupMap,
    ledger: OperationLedger,
    locks: PathLocks,
    backup_max_bytes: u64,
}

impl AtomicFileStore {
    pub fn new(fs: Arc<dyn WorkspaceFs>) -> Self {
        Self::with_config(fs, StoreConfig::default())
    }

    pub fn with_config(fs: Arc<dyn WorkspaceFs>, config: StoreConfig) -> Self {
        Self {
            fs,
            backups: BackupMap::new(),
            ledger: OperationLedger::new(config.history_capacity),
            locks: PathLocks::default(),
            backup_max_bytes: config.backup_max_bytes,
        }
    }

    pub async fn read_text(&self, path: impl AsRef<Path>) -> Result<String> {
        let key = workspace_key(path)?;
        self.fs.read_text(&key).await
    }

    pub fn backup(&self, path: impl AsRef<Path>) -> Option<Backup> {
        let key = workspace_key(path).ok()?;
        self.backups.get(&key)
    }

    pub fn has_backup(&self, path: impl AsRef<Path>) -> bool {
        workspace_key(path)
            .map(|key| self.backups.contains(&key))
            .unwrap_or(false)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn create_file(
        &self,
        path: impl AsRef<Path>,
        content: &str,
        options: CreateOptions,
    ) -> Result<MutationOutcome> {
        let key = workspace_key(path)?;
        let _guard = self.locks.acquire([key.clone()]).await;
        let op_id = self.ledger.begin(OperationKind::Create, vec![key.clone()]);
        tracing::debug!(path = %key.display(), overwrite = options.overwrite, "creating file");

        let result: Result<bool> = async {
            let existing = self.fs.stat(&key).await?;
            match existing {
                Some(info) if info.is_dir => {
                    return Err(StoreError::Validation(format!(
                        "{} is a directory",
                        key.display()
                    )));
                }
                Some(_) if !options.overwrite => {
                    return Err(StoreError::AlreadyExists(key.display().to_string()));
                }
                _ => {}
            }
            let backup_created =
                existing.is_some() && options.create_backup && self.capture_backup(&key).await;
            self.ledger.mark_backup(op_id, backup_created);
            self.apply_edit(&WorkspaceEdit::new().create(&key, content, options.overwrite))
                .await?;
            Ok(backup_created)
        }
        .await;

        self.settle(op_id, OperationKind::Create, vec![key], result)
    }

    #[tracing::instrument(level = "info", skip_all, fields(edits = edits.len()))]
    pub async fn edit_file(
        &self,
        path: impl AsRef<Path>,
        edits: &[TextEdit],
        options: EditOptions,
    ) -> Result<MutationOutcome> {
        let key = workspace_key(path)?;
        let _guard = self.locks.acquire([key.clone()]).await;
        let op_id = self.ledger.begin(OperationKind::Edit, vec![key.clone()]);

        let result: Result<bool> = async {
            self.require_file(&key).await?;
            let backup_created = options.create_backup && self.capture_backup(&key).await;
            self.ledger.mark_backup(op_id, backup_created);

            let applied: Result<()> = async {
                let current = self.fs.read_text(&key).await?;
                let updated = apply_edits(&current, edits)?;
                self.apply_edit(&WorkspaceEdit::new().replace(&key, updated))
                    .await
            }
            .await;

            if let Err(e) = applied {
                if backup_created {
                    tracing::warn!(path = %key.display(), error = %e, "edit failed, rolling back");
                    if let Err(rollback_err) = self.restore(&key).await {
                        tracing::error!(
                            path = %key.display(),
                            error = %rollback_err,
                            original_error = %e,
                            "rollback after failed edit also failed"
                        );
                    }
                } else {
                    tracing::warn!(
                        path = %key.display(),
                        error = %e,
                        "edit failed and no backup was captured; cannot roll back"
                    );
                }
                return Err(e);
            }
            Ok(backup_created)
        }
        .await;

        self.settle(op_id, OperationKind::Edit, vec![key], result)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn delete_file(
        &self,
        path: impl AsRef<Path>,
        options: DeleteOptions,
    ) -> Result<MutationOutcome> {
        let key = workspace_key(path)?;
        let _guard = self.locks.acquire([key.clone()]).await;
        let op_id = self.ledger.begin(OperationKind::Delete, vec![key.clone()]);

        let result: Result<bool> = async {
            let Some(info) = self.fs.stat(&key).await? else {
                return Err(StoreError::NotFound(key.display().to_string()));
            };
            if info.is_dir && !options.recursive {
                return Err(StoreError::Validation(format!(
                    "{} is a directory; recursive delete required",
                    key.display()
                )));
            }
            if info.is_dir && options.create_backup {
                tracing::warn!(path = %key.display(), "directory contents are not backed up");
            }
            let backup_created =
                options.create_backup && !info.is_dir && self.capture_backup(&key).await;
            self.ledger.mark_backup(op_id, backup_created);
            self.apply_edit(&WorkspaceEdit::new().delete(&key, options.recursive))
                .await?;
            Ok(backup_created)
        }
        .await;

        self.settle(op_id, OperationKind::Delete, vec![key], result)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn copy_file(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        options: CopyOptions,
    ) -> Result<MutationOutcome> {
        let from = workspace_key(src)?;
        let to = workspace_key(dst)?;
        if from == to {
            return Err(StoreError::Validation(
                "source and destination are the same path".to_string(),
            ));
        }
        let _guard = self.locks.acquire([from.clone(), to.clone()]).await;
        let op_id = self
            .ledger
            .begin(OperationKind::Copy, vec![from.clone(), to.clone()]);

        let result: Result<bool> = async {
            self.require_file(&from).await?;
            let content = self.fs.read_text(&from).await?;
            let target = self.fs.stat(&to).await?;
            match target {
                Some(info) if info.is_dir => {
                    return Err(StoreError::Validation(format!(
                        "{} is a directory",
                        to.display()
                    )));
                }
                Some(_) if !options.overwrite => {
                    return Err(StoreError::AlreadyExists(to.display().to_string()));
                }
                _ => {}
            }
            let backup_created = target.is_some() && self.capture_backup(&to).await;
            self.ledger.mark_backup(op_id, backup_created);
            self.apply_edit(&WorkspaceEdit::new().create(&to, content, options.overwrite))
                .await?;
            Ok(backup_created)
        }
        .await;

        self.settle(op_id, OperationKind::Copy, vec![from, to], result)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn move_file(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        options: MoveOptions,
    ) -> Result<MutationOutcome> {
        let from = workspace_key(src)?;
        let to = workspace_key(dst)?;
        if from == to {
            return Err(StoreError::Validation(
                "source and destination are the same path".to_string(),
            ));
        }
        let _guard = self.locks.acquire([from.clone(), to.clone()]).await;
        let op_id = self
            .ledger
            .begin(OperationKind::Move, vec![from.clone(), to.clone()]);

        let result: Result<bool> = async {
            let Some(source) = self.fs.stat(&from).await? else {
                return Err(StoreError::NotFound(from.display().to_string()));
            };
            let target = self.fs.stat(&to).await?;
            if target.is_some() && !options.overwrite {
                return Err(StoreError::AlreadyExists(to.display().to_string()));
            }

            let mut backed_up = Vec::new();
            if options.create_backup {
                if !source.is_dir && self.capture_backup(&from).await {
                    backed_up.push(from.clone());
                }
                if target.is_some() && self.capture_backup(&to).await {
                    backed_up.push(to.clone());
                }
            }
            self.ledger.mark_backup(op_id, !backed_up.is_empty());

            if let Err(e) = self
                .apply_edit(&WorkspaceEdit::new().rename(&from, &to, options.overwrite))
                .await
            {
                if backed_up.is_empty() {
                    tracing::warn!(error = %e, "move failed and no backup was captured");
                }
                for path in &backed_up {
                    if let Err(rollback_err) = self.restore(path).await {
                        tracing::error!(
                            path = %path.display(),
                            error = %rollback_err,
                            original_error = %e,
                            "rollback after failed move also failed"
                        );
                    }
                }
                return Err(e);
            }
            Ok(!backed_up.is_empty())
        }
        .await;

        self.settle(op_id, OperationKind::Move, vec![from, to], result)
    }

    /// Applies every valid operation as one combined edit. Never fails as a whole:
    /// per-operation errors and the restore report are in the outcome.
    #[tracing::instrument(level = "info", skip_all, fields(ops = ops.len()))]
    pub async fn batch_operations(&self, ops: &[BatchOp], options: BatchOptions) -> BatchOutcome {
        let resolved: Vec<std::result::Result<Vec<PathBuf>, String>> = ops
            .iter()
            .map(|op| {
                op.raw_paths()
                    .into_iter()
                    .map(workspace_key)
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| e.to_string())
            })
            .collect();
        let mut all_paths: Vec<PathBuf> = resolved
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .flatten()
            .cloned()
            .collect();
        all_paths.sort();
        all_paths.dedup();

        let _guard = self.locks.acquire(all_paths.iter().cloned()).await;
        let op_id = self.ledger.begin(OperationKind::Batch, all_paths);

        let mut results = Vec::with_capacity(ops.len());
        let mut edit = WorkspaceEdit::new();
        let mut touched: HashSet<PathBuf> = HashSet::new();
        let mut needs_backup: Vec<PathBuf> = Vec::new();
        let mut planned = Vec::new();

        for (index, (op, keys)) in ops.iter().zip(resolved).enumerate() {
            let keys = match keys {
                Ok(keys) => keys,
                Err(e) => {
                    results.push(op_result(index, op, Vec::new(), Some(e)));
                    continue;
                }
            };
            if let Some(conflict) = keys.iter().find(|k| touched.contains(*k)) {
                let reason = format!(
                    "{} is already touched by an earlier operation in this batch",
                    conflict.display()
                );
                results.push(op_result(index, op, keys, Some(reason)));
                continue;
            }
            match self.plan_batch_op(op, &keys).await {
                Ok(plan) => {
                    touched.extend(keys.iter().cloned());
                    for change in plan.changes {
                        edit.push(change);
                    }
                    needs_backup.extend(plan.backup_paths);
                    planned.push(results.len());
                    results.push(op_result(index, op, keys, None));
                }
                Err(e) => results.push(op_result(index, op, keys, Some(e.to_string()))),
            }
        }

        needs_backup.sort();
        needs_backup.dedup();
        let mut backed_up = Vec::new();
        if options.create_backup {
            for path in needs_backup {
                if self.capture_backup(&path).await {
                    backed_up.push(path);
                }
            }
        }
        self.ledger.mark_backup(op_id, !backed_up.is_empty());

        let mut applied = false;
        if !edit.is_empty() {
            let failure = match self.fs.apply(&edit).await {
                Ok(true) => None,
                Ok(false) => Some("workspace rejected the combined edit".to_string()),
                Err(e) => Some(e.to_string()),
            };
            match failure {
                None => applied = true,
                Some(reason) => {
                    for idx in &planned {
                        results[*idx].success = false;
                        results[*idx].error = Some(reason.clone());
                    }
                }
            }
        }

        let failed = results.iter().filter(|r| !r.success).count();
        let success = failed == 0;
        let rollback = if success {
            None
        } else {
            tracing::warn!(
                failed,
                applied,
                backups = backed_up.len(),
                "batch incomplete, restoring backed up files"
            );
            let report = self.restore_all(&backed_up).await;
            mark_rolled_back(&mut results, &planned, &report.restored);
            Some(report)
        };

        if success {
            self.ledger.complete(op_id);
        } else {
            self.ledger
                .fail(op_id, format!("{failed} of {} operations failed", ops.len()));
        }
        tracing::info!(
            operation_id = %op_id,
            success,
            applied,
            changes = edit.len(),
            "batch finished"
        );

        BatchOutcome {
            operation_id: op_id,
            success,
            applied,
            results,
            backed_up,
            rollback,
        }
    }

    /// Restores the latest backup of `path` verbatim. The backup is kept, so repeating
    /// the call is harmless.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn rollback_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = workspace_key(path)?;
        let _guard = self.locks.acquire([key.clone()]).await;
        self.restore(&key).await
    }

    /// Restores every path that has a backup and reports per-path results.
    #[tracing::instrument(level = "info", skip_all, fields(paths = paths.len()))]
    pub async fn rollback_batch<P: AsRef<Path>>(&self, paths: &[P]) -> RollbackReport {
        let mut report = RollbackReport::default();
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            match workspace_key(path) {
                Ok(key) => keys.push(key),
                Err(e) => report.failed.push(RollbackFailure {
                    path: path.as_ref().to_path_buf(),
                    error: e.to_string(),
                }),
            }
        }
        let _guard = self.locks.acquire(keys.iter().cloned()).await;
        let restored = self.restore_all(&keys).await;
        report.restored.extend(restored.restored);
        report.failed.extend(restored.failed);
        report
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = self.ledger.stats();
        stats.backups = self.backups.len();
        stats.backup_bytes = self.backups.total_bytes();
        stats
    }

    /// Finished operations, most recent first.
    pub fn history(&self, limit: usize) -> Vec<Operation> {
        self.ledger.history(limit)
    }

    async fn plan_batch_op(&self, op: &BatchOp, keys: &[PathBuf]) -> Result<BatchPlan> {
        let mut plan = BatchPlan {
            changes: Vec::new(),
            backup_paths: Vec::new(),
        };
        match op {
            BatchOp::Create {
                content, overwrite, ..
            } => {
                let path = &keys[0];
                match self.fs.stat(path).await? {
                    Some(info) if info.is_dir => {
                        return Err(StoreError::Validation(format!(
                            "{} is a directory",
                            path.display()
                        )));
                    }
                    Some(_) if !overwrite => {
                        return Err(StoreError::AlreadyExists(path.display().to_string()));
                    }
                    Some(_) => plan.backup_paths.push(path.clone()),
                    None => {}
                }
                plan.changes.push(FileChange::Create {
                    path: path.clone(),
                    content: content.clone(),
                    overwrite: *overwrite,
                });
            }
            BatchOp::Edit { edits, .. } => {
                let path = &keys[0];
                self.require_file(path).await?;
                let current = self.fs.read_text(path).await?;
                let updated = apply_edits(&current, edits)?;
                plan.backup_paths.push(path.clone());
                plan.changes.push(FileChange::Replace {
                    path: path.clone(),
                    content: updated,
                });
            }
            BatchOp::Delete { recursive, .. } => {
                let path = &keys[0];
                let Some(info) = self.fs.stat(path).await? else {
                    return Err(StoreError::NotFound(path.display().to_string()));
                };
                if info.is_dir && !recursive {
                    return Err(StoreError::Validation(format!(
                        "{} is a directory; recursive delete required",
                        path.display()
                    )));
                }
                if !info.is_dir {
                    plan.backup_paths.push(path.clone());
                }
                plan.changes.push(FileChange::Delete {
                    path: path.clone(),
                    recursive: *recursive,
                });
            }
            BatchOp::Copy { overwrite, .. } => {
                let (from, to) = (&keys[0], &keys[1]);
                self.require_file(from).await?;
                let content = self.fs.read_text(from).await?;
                match self.fs.stat(to).await? {
                    Some(info) if info.is_dir => {
                        return Err(StoreError::Validation(format!(
                            "{} is a directory",
                            to.display()
                        )));
                    }
                    Some(_) if !overwrite => {
                        return Err(StoreError::AlreadyExists(to.display().to_string()));
                    }
                    Some(_) => plan.backup_paths.push(to.clone()),
                    None => {}
                }
                plan.changes.push(FileChange::Create {
                    path: to.clone(),
                    content,
                    overwrite: *overwrite,
                });
            }
            BatchOp::Move { overwrite, .. } => {
                let (from, to) = (&keys[0], &keys[1]);
                let Some(source) = self.fs.stat(from).await? else {
                    return Err(StoreError::NotFound(from.display().to_string()));
                };
                if !source.is_dir {
                    plan.backup_paths.push(from.clone());
                }
                if self.fs.stat(to).await?.is_some() {
                    if !overwrite {
                        return Err(StoreError::AlreadyExists(to.display().to_string()));
                    }
                    plan.backup_paths.push(to.clone());
                }
                plan.changes.push(FileChange::Rename {
                    from: from.clone(),
                    to: to.clone(),
                    overwrite: *overwrite,
                });
            }
        }
        Ok(plan)
    }

    async fn require_file(&self, key: &Path) -> Result<()> {
        match self.fs.stat(key).await? {
            Some(info) if !info.is_dir => Ok(()),
            Some(_) => Err(StoreError::Validation(format!(
                "{} is a directory",
                key.display()
            ))),
            None => Err(StoreError::NotFound(key.display().to_string())),
        }
    }

    /// Returns whether a backup now exists for `key`. Missing files, directories,
    /// unreadable files and files over the size ceiling yield `false`.
    async fn capture_backup(&self, key: &Path) -> bool {
        let info = match self.fs.stat(key).await {
            Ok(Some(info)) => info,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(path = %key.display(), error = %e, "backup skipped: stat failed");
                return false;
            }
        };
        if info.is_dir {
            return false;
        }
        if info.len > self.backup_max_bytes {
            tracing::warn!(
                path = %key.display(),
                size_bytes = info.len,
                max_bytes = self.backup_max_bytes,
                "backup skipped: file exceeds size ceiling"
            );
            return false;
        }
        match self.fs.read_text(key).await {
            Ok(content) => {
                tracing::debug!(
                    path = %key.display(),
                    size_bytes = content.len(),
                    "backup captured"
                );
                self.backups.insert(key.to_path_buf(), content);
                true
            }
            Err(e) => {
                tracing::warn!(path = %key.display(), error = %e, "backup skipped: read failed");
                false
            }
        }
    }

    async fn restore(&self, key: &Path) -> Result<()> {
        let backup = self
            .backups
            .get(key)
            .ok_or_else(|| StoreError::NoBackup(key.display().to_string()))?;
        let edit = match self.fs.stat(key).await? {
            Some(info) if info.is_dir => {
                return Err(StoreError::Rollback {
                    path: key.display().to_string(),
                    reason: "path is now a directory".to_string(),
                });
            }
            Some(_) => WorkspaceEdit::new().replace(key, backup.content),
            None => WorkspaceEdit::new().create(key, backup.content, false),
        };
        match self.fs.apply(&edit).await {
            Ok(true) => {
                tracing::info!(
                    path = %key.display(),
                    backup_timestamp = %backup.timestamp,
                    "file restored from backup"
                );
                Ok(())
            }
            Ok(false) => Err(StoreError::Rollback {
                path: key.display().to_string(),
                reason: "workspace rejected the restore".to_string(),
            }),
            Err(e) => Err(StoreError::Rollback {
                path: key.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn restore_all(&self, keys: &[PathBuf]) -> RollbackReport {
        let mut report = RollbackReport::default();
        for key in keys {
            match self.restore(key).await {
                Ok(()) => report.restored.push(key.clone()),
                Err(e) => {
                    tracing::error!(path = %key.display(), error = %e, "restore failed");
                    report.failed.push(RollbackFailure {
                        path: key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn apply_edit(&self, edit: &WorkspaceEdit) -> Result<()> {
        if self.fs.apply(edit).await? {
            Ok(())
        } else {
            Err(StoreError::Execution(
                "workspace rejected the edit".to_string(),
            ))
        }
    }

    fn settle(
        &self,
        op_id: Uuid,
        kind: OperationKind,
        paths: Vec<PathBuf>,
        result: Result<bool>,
    ) -> Result<MutationOutcome> {
        match result {
            Ok(backup_created) => {
                self.ledger.complete(op_id);
                tracing::info!(
                    operation_id = %op_id,
                    kind = kind.as_str(),
                    backup_created,
                    "file operation completed"
                );
                Ok(MutationOutcome {
                    operation_id: op_id,
                    kind,
                    paths,
                    backup_created,
                })
            }
            Err(e) => {
                self.ledger.fail(op_id, e.to_string());
                tracing::warn!(
                    operation_id = %op_id,
                    kind = kind.as_str(),
                    error = %e,
                    "file operation failed"
                );
                Err(e)
            }
        }
    }
}

fn mark_rolled_back(results: &mut [BatchOpResult], planned: &[usize], restored: &[PathBuf]) {
    for idx in planned {
        let result = &mut results[*idx];
        if !result.paths.iter().any(|p| restored.contains(p)) {
            continue;
        }
        result.rolled_back = true;
        if result.success {
            result.success = false;
            result.error = Some("rolled back after another operation in the batch failed".to_string());
        }
    }
}

fn op_result(index: usize, op: &BatchOp, paths: Vec<PathBuf>, error: Option<String>) -> BatchOpResult {
    BatchOpResult {
        index,
        kind: op.kind(),
        paths,
        success: error.is_none(),
        error,
        rolled_back: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EntryInfo, LocalFs};
    use crate::text_edit::Position;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn local_store(root: &Path) -> AtomicFileStore {
        AtomicFileStore::new(Arc::new(LocalFs::new(root).unwrap()))
    }

    /// Lets a replace land on disk and then reports failure, like a write that tore.
    struct TornWriteFs {
        inner: LocalFs,
        armed: AtomicBool,
    }

    #[async_trait]
    impl WorkspaceFs for TornWriteFs {
        async fn apply(&self, edit: &WorkspaceEdit) -> Result<bool> {
            let has_replace = edit
                .changes()
                .iter()
                .any(|c| matches!(c, FileChange::Replace { .. }));
            if has_replace && self.armed.swap(false, Ordering::SeqCst) {
                self.inner.apply(edit).await?;
                return Err(StoreError::Execution("disk full".to_string()));
            }
            self.inner.apply(edit).await
        }

        async fn read_text(&self, path: &Path) -> Result<String> {
            self.inner.read_text(path).await
        }

        async fn stat(&self, path: &Path) -> Result<Option<EntryInfo>> {
            self.inner.stat(path).await
        }
    }

    /// Fails the first edit matching `trigger`. With `lands` the edit reaches disk before
    /// the error; otherwise it is rejected untouched.
    struct FailingFs {
        inner: LocalFs,
        trigger: fn(&WorkspaceEdit) -> bool,
        lands: bool,
        armed: AtomicBool,
    }

    #[async_trait]
    impl WorkspaceFs for FailingFs {
        async fn apply(&self, edit: &WorkspaceEdit) -> Result<bool> {
            if (self.trigger)(edit) && self.armed.swap(false, Ordering::SeqCst) {
                if !self.lands {
                    return Ok(false);
                }
                self.inner.apply(edit).await?;
                return Err(StoreError::Execution("device lost".to_string()));
            }
            self.inner.apply(edit).await
        }

        async fn read_text(&self, path: &Path) -> Result<String> {
            self.inner.read_text(path).await
        }

        async fn stat(&self, path: &Path) -> Result<Option<EntryInfo>> {
            self.inner.stat(path).await
        }
    }

    fn failing_store(root: &Path, trigger: fn(&WorkspaceEdit) -> bool, lands: bool) -> AtomicFileStore {
        AtomicFileStore::new(Arc::new(FailingFs {
            inner: LocalFs::new(root).unwrap(),
            trigger,
            lands,
            armed: AtomicBool::new(true),
        }))
    }

    fn torn_store(root: &Path) -> AtomicFileStore {
        AtomicFileStore::new(Arc::new(TornWriteFs {
            inner: LocalFs::new(root).unwrap(),
            armed: AtomicBool::new(true),
        }))
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        let content = "line one\nline two\n";

        let outcome = store
            .create_file("src/lib.rs", content, CreateOptions::default())
            .await
            .unwrap();
        assert!(!outcome.backup_created);
        assert_eq!(store.read_text("src/lib.rs").await.unwrap(), content);
    }

    #[tokio::test]
    async fn create_refuses_existing_file_unless_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        store
            .create_file("a.txt", "first", CreateOptions::default())
            .await
            .unwrap();

        let err = store
            .create_file("a.txt", "second", CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let outcome = store
            .create_file(
                "a.txt",
                "second",
                CreateOptions {
                    overwrite: true,
                    ..CreateOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.backup_created);
        assert_eq!(store.backup("a.txt").unwrap().content, "first");
        assert_eq!(store.read_text("a.txt").await.unwrap(), "second");
    }

    #[tokio::test]
    async fn edit_then_rollback_restores_original_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let original = "alpha\r\nbeta\r\ngamma";
        tokio::fs::write(tmp.path().join("f.txt"), original).await.unwrap();
        let store = local_store(tmp.path());

        let outcome = store
            .edit_file(
                "f.txt",
                &[TextEdit::replace_line(1, "BETA")],
                EditOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.backup_created);
        assert_eq!(store.read_text("f.txt").await.unwrap(), "alpha\r\nBETA\r\ngamma");

        store.rollback_file("f.txt").await.unwrap();
        let restored = tokio::fs::read(tmp.path().join("f.txt")).await.unwrap();
        assert_eq!(restored, original.as_bytes());

        store.rollback_file("f.txt").await.unwrap();
        let again = tokio::fs::read(tmp.path().join("f.txt")).await.unwrap();
        assert_eq!(again, original.as_bytes());
    }

    #[tokio::test]
    async fn failed_edit_is_rolled_back_and_original_error_returned() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("f.txt"), "keep me").await.unwrap();
        let store = torn_store(tmp.path());

        let err = store
            .edit_file(
                "f.txt",
                &[TextEdit::insert(Position::new(0, 0), "broken ")],
                EditOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(store.read_text("f.txt").await.unwrap(), "keep me");

        let history = store.history(1);
        assert_eq!(history[0].status, crate::ledger::OperationStatus::Failed);
        assert!(history[0].backup_created);
    }

    #[tokio::test]
    async fn invalid_edit_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("f.txt"), "one line").await.unwrap();
        let store = local_store(tmp.path());

        let err = store
            .edit_file(
                "f.txt",
                &[TextEdit::replace_line(4, "nope")],
                EditOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.read_text("f.txt").await.unwrap(), "one line");
    }

    #[tokio::test]
    async fn oversized_file_gets_no_backup_and_cannot_roll_back() {
        let tmp = tempfile::tempdir().unwrap();
        let big = "x".repeat(11 * 1024 * 1024);
        tokio::fs::write(tmp.path().join("big.txt"), &big).await.unwrap();
        let store = torn_store(tmp.path());

        let err = store
            .edit_file(
                "big.txt",
                &[TextEdit::insert(Position::new(0, 0), "y")],
                EditOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(!store.has_backup("big.txt"));
        assert!(!store.history(1)[0].backup_created);

        let err = store.rollback_file("big.txt").await.unwrap_err();
        assert!(matches!(err, StoreError::NoBackup(_)));
    }

    #[tokio::test]
    async fn delete_backs_up_and_rollback_recreates_file() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("doomed.txt"), "precious").await.unwrap();
        let store = local_store(tmp.path());

        let outcome = store
            .delete_file("doomed.txt", DeleteOptions::default())
            .await
            .unwrap();
        assert!(outcome.backup_created);
        assert!(!tmp.path().join("doomed.txt").exists());

        store.rollback_file("doomed.txt").await.unwrap();
        assert_eq!(store.read_text("doomed.txt").await.unwrap(), "precious");
    }

    #[tokio::test]
    async fn delete_missing_file_is_recorded_as_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        let err = store
            .delete_file("ghost.txt", DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.stats().failed, 1);
    }

    #[tokio::test]
    async fn copy_and_move_compose_with_backups() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        tokio::fs::write(tmp.path().join("b.txt"), "B").await.unwrap();
        let store = local_store(tmp.path());

        let err = store
            .copy_file("a.txt", "b.txt", CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let copied = store
            .copy_file("a.txt", "b.txt", CopyOptions { overwrite: true })
            .await
            .unwrap();
        assert!(copied.backup_created);
        assert_eq!(store.read_text("b.txt").await.unwrap(), "A");

        let moved = store
            .move_file("a.txt", "nested/c.txt", MoveOptions::default())
            .await
            .unwrap();
        assert!(moved.backup_created);
        assert!(!tmp.path().join("a.txt").exists());
        assert_eq!(store.read_text("nested/c.txt").await.unwrap(), "A");

        store.rollback_file("b.txt").await.unwrap();
        assert_eq!(store.read_text("b.txt").await.unwrap(), "B");
    }

    #[tokio::test]
    async fn batch_with_invalid_middle_create_keeps_valid_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        let ops = vec![
            BatchOp::Create {
                path: PathBuf::from("one.txt"),
                content: "1".to_string(),
                overwrite: false,
            },
            BatchOp::Create {
                path: PathBuf::from("../two.txt"),
                content: "2".to_string(),
                overwrite: false,
            },
            BatchOp::Create {
                path: PathBuf::from("three.txt"),
                content: "3".to_string(),
                overwrite: false,
            },
        ];

        let outcome = store.batch_operations(&ops, BatchOptions::default()).await;
        assert!(!outcome.success);
        assert!(outcome.applied);
        assert!(outcome.results[0].success);
        assert!(!outcome.results[1].success);
        assert!(outcome.results[2].success);
        assert!(tmp.path().join("one.txt").exists());
        assert!(tmp.path().join("three.txt").exists());
        assert!(!tmp.path().parent().unwrap().join("two.txt").exists());

        let rollback = outcome.rollback.unwrap();
        assert!(rollback.restored.is_empty());
        assert!(rollback.failed.is_empty());
        assert!(outcome.backed_up.is_empty());
    }

    #[tokio::test]
    async fn batch_failure_restores_backed_up_files() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        tokio::fs::write(tmp.path().join("b.txt"), "B").await.unwrap();
        let store = local_store(tmp.path());
        let ops = vec![
            BatchOp::Edit {
                path: PathBuf::from("a.txt"),
                edits: vec![TextEdit::replace_line(0, "A2")],
            },
            BatchOp::Delete {
                path: PathBuf::from("b.txt"),
                recursive: false,
            },
            BatchOp::Create {
                path: PathBuf::from("a.txt"),
                content: "conflict".to_string(),
                overwrite: true,
            },
        ];

        let outcome = store.batch_operations(&ops, BatchOptions::default()).await;
        assert!(!outcome.success);
        assert!(outcome.results[2].error.as_deref().unwrap().contains("already touched"));
        for applied in &outcome.results[..2] {
            assert!(!applied.success, "{:?}", applied.paths);
            assert!(applied.rolled_back);
            assert!(applied.error.as_deref().unwrap().contains("rolled back"));
        }
        assert!(!outcome.results[2].rolled_back);

        let rollback = outcome.rollback.unwrap();
        assert!(rollback.is_complete());
        assert_eq!(rollback.restored.len(), 2);
        assert_eq!(store.read_text("a.txt").await.unwrap(), "A");
        assert_eq!(store.read_text("b.txt").await.unwrap(), "B");
    }

    #[tokio::test]
    async fn rejected_batch_edit_changes_nothing_and_reports_every_op() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        let store = failing_store(tmp.path(), |edit| edit.len() > 1, false);
        let ops = vec![
            BatchOp::Edit {
                path: PathBuf::from("a.txt"),
                edits: vec![TextEdit::replace_line(0, "A2")],
            },
            BatchOp::Create {
                path: PathBuf::from("c.txt"),
                content: "C".to_string(),
                overwrite: false,
            },
        ];

        let outcome = store.batch_operations(&ops, BatchOptions::default()).await;
        assert!(!outcome.success);
        assert!(!outcome.applied);
        for result in &outcome.results {
            assert!(!result.success);
            assert!(result.error.as_deref().unwrap().contains("rejected"));
        }
        let rollback = outcome.rollback.unwrap();
        assert!(rollback.is_complete());
        assert_eq!(rollback.restored, vec![PathBuf::from("a.txt")]);
        assert!(outcome.results[0].rolled_back);
        assert!(!outcome.results[1].rolled_back);
        assert_eq!(store.read_text("a.txt").await.unwrap(), "A");
        assert!(!tmp.path().join("c.txt").exists());
    }

    #[tokio::test]
    async fn torn_batch_edit_is_restored_from_backups() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        tokio::fs::write(tmp.path().join("b.txt"), "B").await.unwrap();
        let store = failing_store(tmp.path(), |edit| edit.len() > 1, true);
        let ops = vec![
            BatchOp::Edit {
                path: PathBuf::from("a.txt"),
                edits: vec![TextEdit::replace_line(0, "A2")],
            },
            BatchOp::Delete {
                path: PathBuf::from("b.txt"),
                recursive: false,
            },
        ];

        let outcome = store.batch_operations(&ops, BatchOptions::default()).await;
        assert!(!outcome.success);
        assert!(!outcome.applied);
        assert!(outcome.results.iter().all(|r| !r.success && r.rolled_back));
        assert!(outcome.results[0].error.as_deref().unwrap().contains("device lost"));

        let rollback = outcome.rollback.unwrap();
        assert!(rollback.is_complete());
        assert_eq!(rollback.restored.len(), 2);
        assert_eq!(store.read_text("a.txt").await.unwrap(), "A");
        assert_eq!(store.read_text("b.txt").await.unwrap(), "B");
        assert_eq!(
            store.history(1)[0].status,
            crate::ledger::OperationStatus::Failed
        );
    }

    #[tokio::test]
    async fn failed_rename_rolls_move_back() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        tokio::fs::write(tmp.path().join("b.txt"), "B").await.unwrap();
        let store = failing_store(
            tmp.path(),
            |edit| {
                edit.changes()
                    .iter()
                    .any(|c| matches!(c, FileChange::Rename { .. }))
            },
            true,
        );

        let err = store
            .move_file(
                "a.txt",
                "b.txt",
                MoveOptions {
                    overwrite: true,
                    create_backup: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Execution(_)), "{err}");
        assert_eq!(store.read_text("a.txt").await.unwrap(), "A");
        assert_eq!(store.read_text("b.txt").await.unwrap(), "B");

        let op = &store.history(1)[0];
        assert_eq!(op.kind, OperationKind::Move);
        assert_eq!(op.status, crate::ledger::OperationStatus::Failed);
        assert!(op.backup_created);
    }

    #[tokio::test]
    async fn batch_applies_all_changes_together() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("old.txt"), "data").await.unwrap();
        let store = local_store(tmp.path());
        let ops: Vec<BatchOp> = serde_json::from_value(serde_json::json!([
            { "op": "create", "path": "new.txt", "content": "fresh" },
            { "op": "move", "from": "old.txt", "to": "moved.txt" }
        ]))
        .unwrap();

        let outcome = store.batch_operations(&ops, BatchOptions::default()).await;
        assert!(outcome.success);
        assert!(outcome.rollback.is_none());
        assert_eq!(outcome.backed_up, vec![PathBuf::from("old.txt")]);
        assert_eq!(store.read_text("moved.txt").await.unwrap(), "data");
        assert_eq!(store.stats().by_kind.get("batch"), Some(&1));
    }

    #[tokio::test]
    async fn rollback_batch_reports_missing_backups_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "A").await.unwrap();
        let store = local_store(tmp.path());
        store
            .edit_file("a.txt", &[TextEdit::replace_line(0, "Z")], EditOptions::default())
            .await
            .unwrap();

        let report = store.rollback_batch(&["a.txt", "never.txt", "../bad"][..]).await;
        assert_eq!(report.restored, vec![PathBuf::from("a.txt")]);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().any(|f| f.error.contains("no backup")));
        assert_eq!(store.read_text("a.txt").await.unwrap(), "A");
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AtomicFileStore::with_config(
            Arc::new(LocalFs::new(tmp.path()).unwrap()),
            StoreConfig {
                history_capacity: 3,
                ..StoreConfig::default()
            },
        );
        for i in 0..5 {
            store
                .create_file(format!("{i}.txt"), "x", CreateOptions::default())
                .await
                .unwrap();
        }

        let history = store.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].file_paths, vec![PathBuf::from("4.txt")]);
        assert_eq!(store.stats().total_operations, 3);
    }

    #[tokio::test]
    async fn concurrent_edits_to_one_path_do_not_lose_updates() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("counter.txt"), "").await.unwrap();
        let store = Arc::new(local_store(tmp.path()));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .edit_file(
                        "counter.txt",
                        &[TextEdit::insert(Position::new(0, 0), "+")],
                        EditOptions::default(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.read_text("counter.txt").await.unwrap(), "+".repeat(10));
    }
}
