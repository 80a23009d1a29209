//! Approval-gated execution of agent-proposed capabilities.

pub mod capability;
pub mod confirmation;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod package;
pub mod terminal;

pub use capability::{
    Capability, CapabilityKind, ExecutionContext, ExecutionReason, ExecutionResult, TerminalMode,
};
pub use confirmation::{ApprovalChoice, ApprovalPrompt, ConfirmationChannel};
pub use error::{ExecutorError, Result};
pub use executor::{ActionExecutor, ExecutorConfig, PendingApproval};
pub use handlers::{ActionHandler, HandlerOutcome, HandlerRegistry};
pub use ledger::{ExecutionRecord, ExecutorStats};
pub use metrics::{InMemoryMetrics, MetricsSink, TracingMetrics};
pub use package::{PackageInstall, PackageManager};
pub use terminal::{CommandOutput, ShellRunner, TerminalRunner};
