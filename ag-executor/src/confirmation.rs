use crate::error::Result;
use ag_policy::RiskLevel;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// What the human sees when an action needs approval.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalPrompt {
    pub capability_id: Uuid,
    pub kind: String,
    pub operation_type: String,
    pub description: String,
    pub risk: RiskLevel,
    /// Full parameter dump, filled in once the human asks for details.
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalChoice {
    Approve,
    Decline,
    ViewDetails,
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn present_approval(&self, prompt: &ApprovalPrompt) -> Result<ApprovalChoice>;
}
