//! Workspace file mutations with backups, rollback and an operation ledger.

pub mod backup;
pub mod error;
pub mod fs;
pub mod ledger;
mod locks;
pub mod store;
pub mod text_edit;

pub use backup::{Backup, DEFAULT_BACKUP_MAX_BYTES};
pub use error::{Result, StoreError};
pub use fs::{EntryInfo, FileChange, LocalFs, WorkspaceEdit, WorkspaceFs, workspace_key};
pub use ledger::{Operation, OperationKind, OperationStatus, StoreStats};
pub use store::{
    AtomicFileStore, BatchOp, BatchOpResult, BatchOptions, BatchOutcome, CopyOptions,
    CreateOptions, DeleteOptions, EditOptions, MoveOptions, MutationOutcome, RollbackFailure,
    RollbackReport, StoreConfig,
};
pub use text_edit::{EditTarget, Position, Range, TextEdit, apply_edits};
