//! CLI command handlers.

use crate::config::AgentGateConfig;
use crate::console::{ConsoleConfirmation, ConsoleTerminal};
use ag_executor::{
    ActionExecutor, Capability, ExecutionContext, ExecutionResult, ExecutorConfig, ExecutorStats,
    HandlerRegistry, ShellRunner, TerminalMode,
};
use ag_policy::{AutonomyMode, PolicyManager, RiskLevel, TomlSettingsStore};
use ag_store::{AtomicFileStore, LocalFs, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeAction {
    Show,
    Set(AutonomyMode),
    Toggle,
}

impl ModeAction {
    pub fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("show") => Ok(Self::Show),
            Some("toggle") => Ok(Self::Toggle),
            Some(other) => Ok(Self::Set(other.parse::<AutonomyMode>()?)),
        }
    }
}

/// Loads the persisted policy and applies a configured startup mode, if any.
pub async fn load_policy(cfg: &AgentGateConfig) -> anyhow::Result<Arc<PolicyManager>> {
    let settings = Arc::new(TomlSettingsStore::new(cfg.settings_path()));
    let policy = Arc::new(PolicyManager::load(settings).await);
    if let Some(mode) = cfg.general.mode {
        if mode != policy.mode() {
            let transition = policy.set_mode(mode).await?;
            tracing::info!(
                previous = %transition.previous,
                current = %transition.current,
                "startup mode applied"
            );
        }
    }
    Ok(policy)
}

pub async fn mode(cfg: &AgentGateConfig, action: ModeAction) -> anyhow::Result<()> {
    let policy = load_policy(cfg).await?;
    let transition = match action {
        ModeAction::Show => {
            println!("mode={}", policy.mode());
            return Ok(());
        }
        ModeAction::Set(mode) => policy.set_mode(mode).await?,
        ModeAction::Toggle => policy.toggle_mode().await?,
    };
    if transition.changed() {
        println!("mode: {} -> {}", transition.previous, transition.current);
    } else {
        println!("mode={} (unchanged)", transition.current);
    }
    Ok(())
}

pub async fn check(cfg: &AgentGateConfig, operation_type: &str, risk: RiskLevel) -> anyhow::Result<()> {
    let policy = load_policy(cfg).await?;
    println!("{}", describe_check(&policy, operation_type, risk)?);
    Ok(())
}

pub fn describe_check(
    policy: &PolicyManager,
    operation_type: &str,
    risk: RiskLevel,
) -> anyhow::Result<String> {
    let settings = policy.operation_settings(operation_type);
    let flags = serde_json::to_string(&settings.flags)?;
    Ok(format!(
        "mode={}\noperation={operation_type}\nrisk={risk}\nrequires_approval={}\ncategory={}\nflags={flags}",
        policy.mode(),
        policy.requires_approval(operation_type, risk),
        settings.category.as_str(),
    ))
}

pub async fn allow(cfg: &AgentGateConfig, operation_type: &str, allowed: bool) -> anyhow::Result<()> {
    let policy = load_policy(cfg).await?;
    policy.set_auto_execute(operation_type, allowed).await?;
    println!("{operation_type}: auto_execute={allowed}");
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub capture: bool,
    pub no_backup: bool,
}

/// Executes every capability in `file` one after another, then prints executor stats.
#[tracing::instrument(level = "info", skip_all, fields(file = %file.display()))]
pub async fn run(cfg: &AgentGateConfig, file: &Path, options: RunOptions) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| anyhow::anyhow!("read capabilities {}: {e}", file.display()))?;
    let capabilities = parse_capabilities(&raw)?;

    let executor = build_executor(cfg).await?;
    let context = ExecutionContext {
        create_backup: !options.no_backup,
        terminal_mode: if options.capture || cfg.terminal.capture {
            TerminalMode::Capture
        } else {
            TerminalMode::Surface
        },
        ..ExecutionContext::default()
    };

    tracing::info!(count = capabilities.len(), mode = %executor.policy().mode(), "running capabilities");
    for capability in capabilities {
        let result = executor.execute_capability(capability, context.clone()).await;
        println!("{}", format_result(&result));
    }
    println!("{}", format_stats(&executor.stats()));
    Ok(())
}

async fn build_executor(cfg: &AgentGateConfig) -> anyhow::Result<ActionExecutor> {
    let workspace = cfg.workspace_dir();
    let policy = load_policy(cfg).await?;

    let fs = LocalFs::new(&workspace)
        .map_err(|e| anyhow::anyhow!("open workspace {}: {e}", workspace.display()))?;
    let store = Arc::new(AtomicFileStore::with_config(
        Arc::new(fs),
        StoreConfig {
            backup_max_bytes: cfg.store.backup_max_bytes,
            history_capacity: cfg.store.history_capacity,
        },
    ));
    let shell = ShellRunner::new(&workspace, Duration::from_secs(cfg.terminal.timeout_secs));
    let terminal = Arc::new(ConsoleTerminal::new(shell));
    let confirmation = Arc::new(ConsoleConfirmation::new(
        policy.clone(),
        cfg.confirmation.clone(),
    ));

    tracing::debug!(workspace = %workspace.display(), "executor wired");
    Ok(ActionExecutor::with_config(
        policy,
        confirmation,
        HandlerRegistry::standard(store, terminal),
        ExecutorConfig {
            history_capacity: cfg.executor.history_capacity,
            recent_records: cfg.executor.recent_records,
            max_detail_rounds: cfg.executor.max_detail_rounds,
        },
    ))
}

/// Accepts a single capability object or an array of them.
pub fn parse_capabilities(raw: &str) -> anyhow::Result<Vec<Capability>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let capabilities = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(capabilities)
}

pub fn format_result(result: &ExecutionResult) -> String {
    let status = if result.success { "ok" } else { "failed" };
    let mut out = format!(
        "[{status}] {} {}: {} ({}ms)",
        result.kind, result.capability_id, result.message, result.duration_ms
    );
    if let Some(reason) = result.reason {
        out.push_str(&format!("\n  reason={}", reason.as_str()));
    }
    if let Some(error) = &result.error {
        out.push_str(&format!("\n  error={error}"));
    }
    if let Some(value) = &result.result {
        out.push_str(&format!("\n  result={value}"));
    }
    out
}

pub fn format_stats(stats: &ExecutorStats) -> String {
    format!(
        "executions={} successful={} failed={} success_rate={:.2}",
        stats.total, stats.successful, stats.failed, stats.success_rate
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_executor::ExecutionReason;
    use ag_policy::MemorySettingsStore;

    #[test]
    fn mode_action_parses_known_words() {
        assert_eq!(ModeAction::parse(None).unwrap(), ModeAction::Show);
        assert_eq!(ModeAction::parse(Some("Toggle")).unwrap(), ModeAction::Toggle);
        assert_eq!(
            ModeAction::parse(Some("autonomous")).unwrap(),
            ModeAction::Set(AutonomyMode::Autonomous)
        );
        assert!(ModeAction::parse(Some("yolo")).is_err());
    }

    #[test]
    fn capabilities_file_accepts_object_or_array() {
        let one = parse_capabilities(
            r#"{"type": "file_creation", "risk": "low", "description": "readme",
                "parameters": {"path": "README.md", "content": "hi"}}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].kind.as_str(), "file_creation");

        let many = parse_capabilities(
            r#"[
                {"type": "terminal_command", "risk": "medium", "description": "list",
                 "parameters": {"command": "ls"}},
                {"type": "file_deletion", "risk": "high", "description": "rm",
                 "parameters": {"path": "old.txt"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].risk, RiskLevel::High);

        assert!(parse_capabilities("{\"type\": 3}").is_err());
    }

    #[tokio::test]
    async fn check_reports_gate_and_flags() {
        let policy = PolicyManager::load(Arc::new(MemorySettingsStore::new())).await;
        let text = describe_check(&policy, "file_creation", RiskLevel::Low).unwrap();
        assert!(text.contains("mode=collaborative"));
        assert!(text.contains("requires_approval=true"));
        assert!(text.contains("category=file"));

        policy.set_mode(AutonomyMode::Autonomous).await.unwrap();
        let text = describe_check(&policy, "file_creation", RiskLevel::Low).unwrap();
        assert!(text.contains("requires_approval=false"));
        let text = describe_check(&policy, "file_deletion", RiskLevel::Low).unwrap();
        assert!(text.contains("requires_approval=true"));
    }

    #[tokio::test]
    async fn startup_mode_is_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = AgentGateConfig::default();
        cfg.general.settings_path = Some(tmp.path().join("settings.toml"));
        cfg.general.mode = Some(AutonomyMode::Autonomous);
        let policy = load_policy(&cfg).await.unwrap();
        assert_eq!(policy.mode(), AutonomyMode::Autonomous);

        cfg.general.mode = None;
        let reloaded = load_policy(&cfg).await.unwrap();
        assert_eq!(reloaded.mode(), AutonomyMode::Autonomous);
    }

    #[test]
    fn failed_result_shows_reason() {
        let result = ExecutionResult {
            capability_id: uuid::Uuid::nil(),
            success: false,
            kind: "file_deletion".to_string(),
            message: "declined by user".to_string(),
            reason: Some(ExecutionReason::UserDeclined),
            result: None,
            error: None,
            approval_requested: true,
            duration_ms: 3,
        };
        let text = format_result(&result);
        assert!(text.starts_with("[failed] file_deletion"));
        assert!(text.contains("reason=user_declined"));
    }
}
