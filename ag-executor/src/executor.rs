use crate::capability::{Capability, ExecutionContext, ExecutionReason, ExecutionResult};
use crate::confirmation::{ApprovalChoice, ApprovalPrompt, ConfirmationChannel};
use crate::handlers::{ActionHandler, HandlerOutcome, HandlerRegistry};
use crate::ledger::{DEFAULT_EXECUTION_HISTORY, ExecutionLedger, ExecutionRecord, ExecutorStats};
use crate::metrics::{MetricsSink, TracingMetrics};
use ag_policy::PolicyManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub history_capacity: usize,
    /// Records included in [`ExecutorStats::recent`].
    pub recent_records: usize,
    /// View-details requests allowed before the prompt counts as declined.
    pub max_detail_rounds: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_EXECUTION_HISTORY,
            recent_records: 10,
            max_detail_rounds: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub capability_id: Uuid,
    pub capability: Capability,
    pub requested_at: DateTime<Utc>,
}

enum ApprovalDecision {
    Approved,
    Declined,
    Failed(String),
}

struct Draft {
    success: bool,
    message: String,
    reason: Option<ExecutionReason>,
    result: Option<Value>,
    error: Option<String>,
}

impl Draft {
    fn rejected(reason: ExecutionReason, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            reason: Some(reason),
            result: None,
            error,
        }
    }
}

impl From<HandlerOutcome> for Draft {
    fn from(outcome: HandlerOutcome) -> Self {
        let reason = if outcome.success {
            None
        } else {
            Some(outcome.failure.unwrap_or(ExecutionReason::ExecutionError))
        };
        Self {
            success: outcome.success,
            error: (!outcome.success).then(|| outcome.message.clone()),
            message: outcome.message,
            reason,
            result: outcome.result,
        }
    }
}

/// Removes its pending-approval entry when dropped, including on cancellation.
struct PendingEntry<'a> {
    pending: &'a DashMap<Uuid, PendingApproval>,
    id: Uuid,
}

impl<'a> PendingEntry<'a> {
    fn insert(pending: &'a DashMap<Uuid, PendingApproval>, id: Uuid, capability: &Capability) -> Self {
        pending.insert(
            id,
            PendingApproval {
                capability_id: id,
                capability: capability.clone(),
                requested_at: Utc::now(),
            },
        );
        Self { pending, id }
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Takes proposed capabilities through validation, the approval gate and dispatch, and
/// records every attempt.
pub struct ActionExecutor {
    policy: Arc<PolicyManager>,
    confirmation: Arc<dyn ConfirmationChannel>,
    handlers: HandlerRegistry,
    metrics: Arc<dyn MetricsSink>,
    ledger: ExecutionLedger,
    pending: DashMap<Uuid, PendingApproval>,
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(
        policy: Arc<PolicyManager>,
        confirmation: Arc<dyn ConfirmationChannel>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self::with_config(policy, confirmation, handlers, ExecutorConfig::default())
    }

    pub fn with_config(
        policy: Arc<PolicyManager>,
        confirmation: Arc<dyn ConfirmationChannel>,
        handlers: HandlerRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            policy,
            confirmation,
            handlers,
            metrics: Arc::new(TracingMetrics),
            ledger: ExecutionLedger::new(config.history_capacity),
            pending: DashMap::new(),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &Arc<PolicyManager> {
        &self.policy
    }

    /// Never fails: declines, invalid parameters and handler errors all come back as an
    /// unsuccessful result and are recorded.
    #[tracing::instrument(level = "info", skip_all, fields(kind = %capability.kind, risk = %capability.risk))]
    pub async fn execute_capability(
        &self,
        capability: Capability,
        context: ExecutionContext,
    ) -> ExecutionResult {
        let capability_id = Uuid::new_v4();
        let started = Instant::now();
        let handler = self.handlers.resolve(&capability.kind);
        let operation_type = handler.operation_type(&capability);
        tracing::info!(
            capability_id = %capability_id,
            operation_type = %operation_type,
            action_id = ?capability.action_id,
            "capability proposed"
        );

        let (draft, approval_requested) = self
            .run(capability_id, &capability, &context, handler.as_ref(), &operation_type)
            .await;

        let result = ExecutionResult {
            capability_id,
            success: draft.success,
            kind: capability.kind.as_str().to_string(),
            message: draft.message,
            reason: draft.reason,
            result: draft.result,
            error: draft.error,
            approval_requested,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let outcome = result.reason.map(ExecutionReason::as_str).unwrap_or("success");
        self.metrics.increment(&format!("{operation_type}.{outcome}"));
        tracing::info!(
            capability_id = %capability_id,
            success = result.success,
            outcome,
            duration_ms = result.duration_ms,
            "capability finished"
        );

        self.ledger.append(ExecutionRecord {
            id: capability_id,
            capability,
            result: result.clone(),
            context_snapshot: context,
            timestamp: Utc::now(),
            success: result.success,
        });
        result
    }

    async fn run(
        &self,
        capability_id: Uuid,
        capability: &Capability,
        context: &ExecutionContext,
        handler: &dyn ActionHandler,
        operation_type: &str,
    ) -> (Draft, bool) {
        if let Err(e) = handler.validate(capability) {
            tracing::info!(error = %e, "capability rejected by validation");
            let draft = Draft::rejected(
                ExecutionReason::ValidationError,
                format!("invalid parameters: {e}"),
                Some(e.to_string()),
            );
            return (draft, false);
        }

        let approval_requested = self
            .policy
            .requires_approval(operation_type, capability.risk);
        if approval_requested {
            match self
                .request_approval(capability_id, capability, operation_type)
                .await
            {
                ApprovalDecision::Approved => {}
                ApprovalDecision::Declined => {
                    let draft = Draft::rejected(
                        ExecutionReason::UserDeclined,
                        "declined by user",
                        None,
                    );
                    return (draft, true);
                }
                ApprovalDecision::Failed(error) => {
                    let draft = Draft::rejected(
                        ExecutionReason::ApprovalFailed,
                        "approval could not be obtained",
                        Some(error),
                    );
                    return (draft, true);
                }
            }
        }

        let draft = match handler.handle(capability, context).await {
            Ok(outcome) => Draft::from(outcome),
            Err(e) => {
                tracing::error!(capability_id = %capability_id, error = %e, "capability execution failed");
                Draft::rejected(
                    ExecutionReason::ExecutionError,
                    format!("execution failed: {e}"),
                    Some(e.to_string()),
                )
            }
        };
        (draft, approval_requested)
    }

    async fn request_approval(
        &self,
        capability_id: Uuid,
        capability: &Capability,
        operation_type: &str,
    ) -> ApprovalDecision {
        let _pending = PendingEntry::insert(&self.pending, capability_id, capability);
        let mut prompt = ApprovalPrompt {
            capability_id,
            kind: capability.kind.as_str().to_string(),
            operation_type: operation_type.to_string(),
            description: capability.description.clone(),
            risk: capability.risk,
            details: None,
        };

        for round in 0..self.config.max_detail_rounds.max(1) {
            match self.confirmation.present_approval(&prompt).await {
                Ok(ApprovalChoice::Approve) => {
                    tracing::info!(capability_id = %capability_id, round, "capability approved");
                    return ApprovalDecision::Approved;
                }
                Ok(ApprovalChoice::Decline) => {
                    tracing::info!(capability_id = %capability_id, round, "capability declined");
                    return ApprovalDecision::Declined;
                }
                Ok(ApprovalChoice::ViewDetails) => {
                    tracing::debug!(capability_id = %capability_id, round, "approval details requested");
                    prompt.details = Some(render_details(capability));
                }
                Err(e) => {
                    tracing::warn!(
                        capability_id = %capability_id,
                        error = %e,
                        "approval failed, treating as denied"
                    );
                    return ApprovalDecision::Failed(e.to_string());
                }
            }
        }
        tracing::warn!(
            capability_id = %capability_id,
            rounds = self.config.max_detail_rounds,
            "no decision after repeated detail requests, treating as declined"
        );
        ApprovalDecision::Declined
    }

    /// Outstanding approvals, oldest first.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<PendingApproval> =
            self.pending.iter().map(|entry| entry.value().clone()).collect();
        pending.sort_by_key(|p| p.requested_at);
        pending
    }

    pub fn stats(&self) -> ExecutorStats {
        self.ledger
            .stats(self.pending.len(), self.config.recent_records)
    }

    /// Execution records, most recent first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.ledger.history(limit)
    }
}

fn render_details(capability: &Capability) -> String {
    let parameters = serde_json::to_string_pretty(&capability.parameters)
        .unwrap_or_else(|_| format!("{:?}", capability.parameters));
    format!(
        "type: {}\nrisk: {}\ndescription: {}\naction_id: {}\nparameters:\n{parameters}",
        capability.kind,
        capability.risk,
        capability.description,
        capability.action_id.as_deref().unwrap_or("-"),
    )
}
