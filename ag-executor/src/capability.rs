use crate::error::{ExecutorError, Result};
use ag_policy::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityKind {
    FileCreation,
    FileEdit,
    FileDeletion,
    TerminalCommand,
    PackageInstallation,
    Other(String),
}

impl CapabilityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FileCreation => "file_creation",
            Self::FileEdit => "file_edit",
            Self::FileDeletion => "file_deletion",
            Self::TerminalCommand => "terminal_command",
            Self::PackageInstallation => "package_installation",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for CapabilityKind {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "file_creation" => Self::FileCreation,
            "file_edit" => Self::FileEdit,
            "file_deletion" => Self::FileDeletion,
            "terminal_command" => Self::TerminalCommand,
            "package_installation" => Self::PackageInstallation,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for CapabilityKind {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<CapabilityKind> for String {
    fn from(kind: CapabilityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action proposed by the agent, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub action_id: Option<String>,
}

impl Capability {
    pub fn new(kind: impl Into<CapabilityKind>, risk: RiskLevel, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            risk,
            description: description.into(),
            parameters: Map::new(),
            action_id: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        let Some(v) = self.parameters.get(key) else {
            return Err(ExecutorError::InvalidArguments(format!("missing key: {key}")));
        };
        match v {
            Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
            Value::String(_) => Err(ExecutorError::InvalidArguments(format!(
                "key {key} must not be empty"
            ))),
            other => Err(ExecutorError::InvalidArguments(format!(
                "key {key} must be string, got {other:?}"
            ))),
        }
    }

    /// Like [`Capability::require_string`] but allows an empty string.
    pub fn require_text(&self, key: &str) -> Result<String> {
        match self.parameters.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(ExecutorError::InvalidArguments(format!(
                "key {key} must be string, got {other:?}"
            ))),
            None => Err(ExecutorError::InvalidArguments(format!("missing key: {key}"))),
        }
    }

    pub fn optional_string(&self, key: &str) -> Result<Option<String>> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ExecutorError::InvalidArguments(format!(
                "key {key} must be string, got {other:?}"
            ))),
        }
    }

    pub fn optional_bool(&self, key: &str) -> Result<bool> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(ExecutorError::InvalidArguments(format!(
                "key {key} must be boolean, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalMode {
    /// Hand the command to the human to run.
    #[default]
    Surface,
    /// Spawn it and capture the output.
    Capture,
}

/// Caller options for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default = "default_true")]
    pub create_backup: bool,
    #[serde(default)]
    pub terminal_mode: TerminalMode,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            create_backup: true,
            terminal_mode: TerminalMode::Surface,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionReason {
    UserDeclined,
    ApprovalFailed,
    ValidationError,
    ExecutionError,
    NotImplemented,
    CommandFailed,
}

impl ExecutionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserDeclined => "user_declined",
            Self::ApprovalFailed => "approval_failed",
            Self::ValidationError => "validation_error",
            Self::ExecutionError => "execution_error",
            Self::NotImplemented => "not_implemented",
            Self::CommandFailed => "command_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub capability_id: Uuid,
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ExecutionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether a human was asked before dispatch.
    pub approval_requested: bool,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_parses_from_agent_json() {
        let cap: Capability = serde_json::from_value(serde_json::json!({
            "type": "file_creation",
            "risk": "low",
            "description": "add readme",
            "parameters": { "path": "README.md", "content": "" },
            "action_id": "a-1"
        }))
        .unwrap();
        assert_eq!(cap.kind, CapabilityKind::FileCreation);
        assert_eq!(cap.require_text("content").unwrap(), "");
        assert!(cap.require_string("content").is_err());
        assert!(!cap.optional_bool("overwrite").unwrap());
    }

    #[test]
    fn unknown_kinds_survive_round_trip() {
        let cap: Capability = serde_json::from_value(serde_json::json!({
            "type": "git_commit",
            "risk": "medium"
        }))
        .unwrap();
        assert_eq!(cap.kind, CapabilityKind::Other("git_commit".to_string()));
        assert_eq!(serde_json::to_value(&cap).unwrap()["type"], "git_commit");
    }

    #[test]
    fn context_defaults_request_backups() {
        let ctx: ExecutionContext = serde_json::from_str("{}").unwrap();
        assert!(ctx.create_backup);
        assert_eq!(ctx.terminal_mode, TerminalMode::Surface);
    }
}
