//! Autonomy mode and approval rules for agent-proposed operations.

pub mod classify;
pub mod error;
pub mod manager;
pub mod matrix;
pub mod mode;
pub mod settings;

pub use classify::{classify_command, terminal_operation_type};
pub use error::{PolicyError, Result};
pub use manager::{OperationSettings, PolicyManager};
pub use matrix::{
    CategoryFlags, DESTRUCTIVE_OPERATIONS, OperationCategory, PolicyMatrix, flag_for,
    is_destructive,
};
pub use mode::{AutonomyMode, ModeTransition, RiskLevel};
pub use settings::{MemorySettingsStore, SettingsStore, TomlSettingsStore};
