use crate::capability::{Capability, CapabilityKind, ExecutionContext, ExecutionReason, TerminalMode};
use crate::error::{ExecutorError, Result};
use crate::package::PackageInstall;
use crate::terminal::{TerminalRunner, validate_working_directory};
use ag_store::{AtomicFileStore, CreateOptions, DeleteOptions, EditOptions, TextEdit};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Uniform handler result.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub kind: String,
    pub message: String,
    pub result: Option<Value>,
    pub failure: Option<ExecutionReason>,
}

impl HandlerOutcome {
    pub fn ok(kind: &CapabilityKind, message: impl Into<String>, result: Value) -> Self {
        Self {
            success: true,
            kind: kind.as_str().to_string(),
            message: message.into(),
            result: Some(result),
            failure: None,
        }
    }

    pub fn failed(
        kind: &CapabilityKind,
        reason: ExecutionReason,
        message: impl Into<String>,
        result: Option<Value>,
    ) -> Self {
        Self {
            success: false,
            kind: kind.as_str().to_string(),
            message: message.into(),
            result,
            failure: Some(reason),
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Rejects bad parameters before any approval or dispatch.
    fn validate(&self, capability: &Capability) -> Result<()>;

    /// The policy operation type this capability is checked under.
    fn operation_type(&self, capability: &Capability) -> String {
        capability.kind.as_str().to_string()
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome>;
}

/// Handlers by capability kind; unknown kinds get [`NotImplementedHandler`].
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(NotImplementedHandler),
        }
    }

    /// File handlers over `store`, terminal and package handlers over `terminal`.
    pub fn standard(store: Arc<AtomicFileStore>, terminal: Arc<dyn TerminalRunner>) -> Self {
        let mut registry = Self::empty();
        registry.register(
            CapabilityKind::FileCreation,
            Arc::new(FileCreationHandler::new(store.clone())),
        );
        registry.register(
            CapabilityKind::FileEdit,
            Arc::new(FileEditHandler::new(store.clone())),
        );
        registry.register(
            CapabilityKind::FileDeletion,
            Arc::new(FileDeletionHandler::new(store)),
        );
        registry.register(
            CapabilityKind::TerminalCommand,
            Arc::new(TerminalCommandHandler::new(terminal.clone())),
        );
        registry.register(
            CapabilityKind::PackageInstallation,
            Arc::new(PackageInstallationHandler::new(terminal)),
        );
        registry
    }

    pub fn register(&mut self, kind: CapabilityKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.as_str().to_string(), handler);
    }

    pub fn resolve(&self, kind: &CapabilityKind) -> Arc<dyn ActionHandler> {
        self.handlers
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct NotImplementedHandler;

#[async_trait]
impl ActionHandler for NotImplementedHandler {
    fn validate(&self, _capability: &Capability) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, capability: &Capability, _context: &ExecutionContext) -> Result<HandlerOutcome> {
        tracing::warn!(kind = %capability.kind, "no handler for capability kind");
        Ok(HandlerOutcome::failed(
            &capability.kind,
            ExecutionReason::NotImplemented,
            format!("capability type {} is not implemented", capability.kind),
            None,
        ))
    }
}

pub struct FileCreationHandler {
    store: Arc<AtomicFileStore>,
}

impl FileCreationHandler {
    pub fn new(store: Arc<AtomicFileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for FileCreationHandler {
    fn validate(&self, capability: &Capability) -> Result<()> {
        ag_store::workspace_key(capability.require_string("path")?)?;
        capability.require_text("content")?;
        capability.optional_bool("overwrite")?;
        Ok(())
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome> {
        let path = capability.require_string("path")?;
        let content = capability.require_text("content")?;
        let options = CreateOptions {
            overwrite: capability.optional_bool("overwrite")?,
            create_backup: context.create_backup,
        };
        let outcome = self.store.create_file(&path, &content, options).await?;
        Ok(HandlerOutcome::ok(
            &capability.kind,
            format!("created {path}"),
            json!({
                "path": path,
                "bytes": content.len(),
                "operation_id": outcome.operation_id,
                "backup_created": outcome.backup_created,
            }),
        ))
    }
}

pub struct FileEditHandler {
    store: Arc<AtomicFileStore>,
}

impl FileEditHandler {
    pub fn new(store: Arc<AtomicFileStore>) -> Self {
        Self { store }
    }

    /// `edits` is a list of positional edits; a bare `content` replaces the whole file.
    async fn edits(&self, capability: &Capability, path: &str) -> Result<Vec<TextEdit>> {
        if let Some(raw) = capability.parameters.get("edits") {
            let edits: Vec<TextEdit> = serde_json::from_value(raw.clone())
                .map_err(|e| ExecutorError::InvalidArguments(format!("invalid edits: {e}")))?;
            if edits.is_empty() {
                return Err(ExecutorError::InvalidArguments("edits must not be empty".to_string()));
            }
            return Ok(edits);
        }
        let content = capability.require_text("content")?;
        let current = self.store.read_text(path).await?;
        Ok(vec![whole_file_edit(&current, content)])
    }
}

fn whole_file_edit(current: &str, content: String) -> TextEdit {
    let last_line = current.split('\n').count() - 1;
    let last_len = current
        .rsplit('\n')
        .next()
        .map(|line| line.chars().count())
        .unwrap_or(0);
    TextEdit::replace(
        ag_store::Position::new(0, 0),
        ag_store::Position::new(last_line, last_len),
        content,
    )
}

#[async_trait]
impl ActionHandler for FileEditHandler {
    fn validate(&self, capability: &Capability) -> Result<()> {
        ag_store::workspace_key(capability.require_string("path")?)?;
        match capability.parameters.get("edits") {
            Some(raw) => {
                serde_json::from_value::<Vec<TextEdit>>(raw.clone())
                    .map_err(|e| ExecutorError::InvalidArguments(format!("invalid edits: {e}")))?;
            }
            None => {
                capability.require_text("content")?;
            }
        }
        Ok(())
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome> {
        let path = capability.require_string("path")?;
        let edits = self.edits(capability, &path).await?;
        let outcome = self
            .store
            .edit_file(
                &path,
                &edits,
                EditOptions {
                    create_backup: context.create_backup,
                },
            )
            .await?;
        Ok(HandlerOutcome::ok(
            &capability.kind,
            format!("edited {path}"),
            json!({
                "path": path,
                "edits": edits.len(),
                "operation_id": outcome.operation_id,
                "backup_created": outcome.backup_created,
            }),
        ))
    }
}

pub struct FileDeletionHandler {
    store: Arc<AtomicFileStore>,
}

impl FileDeletionHandler {
    pub fn new(store: Arc<AtomicFileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for FileDeletionHandler {
    fn validate(&self, capability: &Capability) -> Result<()> {
        ag_store::workspace_key(capability.require_string("path")?)?;
        capability.optional_bool("recursive")?;
        Ok(())
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome> {
        let path = capability.require_string("path")?;
        let recursive = capability.optional_bool("recursive")?;
        let outcome = self
            .store
            .delete_file(
                &path,
                DeleteOptions {
                    create_backup: context.create_backup,
                    recursive,
                },
            )
            .await?;
        Ok(HandlerOutcome::ok(
            &capability.kind,
            format!("deleted {path}"),
            json!({
                "path": path,
                "operation_id": outcome.operation_id,
                "backup_created": outcome.backup_created,
            }),
        ))
    }
}

async fn run_command(
    terminal: &dyn TerminalRunner,
    capability: &Capability,
    context: &ExecutionContext,
    command: &str,
    working_directory: &Path,
) -> Result<HandlerOutcome> {
    match context.terminal_mode {
        TerminalMode::Surface => {
            terminal.surface(command, working_directory).await?;
            Ok(HandlerOutcome::ok(
                &capability.kind,
                "command surfaced for manual run",
                json!({
                    "command": command,
                    "working_directory": working_directory.display().to_string(),
                    "mode": "surface",
                }),
            ))
        }
        TerminalMode::Capture => {
            let output = terminal.run_captured(command, working_directory).await?;
            let result = json!({
                "command": command,
                "mode": "capture",
                "output": output,
            });
            if output.succeeded() {
                Ok(HandlerOutcome::ok(&capability.kind, "command completed", result))
            } else {
                Ok(HandlerOutcome::failed(
                    &capability.kind,
                    ExecutionReason::CommandFailed,
                    format!("command exited with code {}", output.exit_code),
                    Some(result),
                ))
            }
        }
    }
}

pub struct TerminalCommandHandler {
    terminal: Arc<dyn TerminalRunner>,
}

impl TerminalCommandHandler {
    pub fn new(terminal: Arc<dyn TerminalRunner>) -> Self {
        Self { terminal }
    }
}

#[async_trait]
impl ActionHandler for TerminalCommandHandler {
    fn validate(&self, capability: &Capability) -> Result<()> {
        capability.require_string("command")?;
        validate_working_directory(capability.optional_string("working_directory")?.as_deref())?;
        Ok(())
    }

    /// Commands that amount to a destructive operation are checked as that operation.
    fn operation_type(&self, capability: &Capability) -> String {
        capability
            .require_string("command")
            .map(|command| ag_policy::terminal_operation_type(&command).to_string())
            .unwrap_or_else(|_| capability.kind.as_str().to_string())
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome> {
        let command = capability.require_string("command")?;
        let working_directory =
            validate_working_directory(capability.optional_string("working_directory")?.as_deref())?;
        run_command(
            self.terminal.as_ref(),
            capability,
            context,
            &command,
            &working_directory,
        )
        .await
    }
}

pub struct PackageInstallationHandler {
    terminal: Arc<dyn TerminalRunner>,
}

impl PackageInstallationHandler {
    pub fn new(terminal: Arc<dyn TerminalRunner>) -> Self {
        Self { terminal }
    }
}

#[async_trait]
impl ActionHandler for PackageInstallationHandler {
    fn validate(&self, capability: &Capability) -> Result<()> {
        PackageInstall::from_capability(capability)?;
        validate_working_directory(capability.optional_string("working_directory")?.as_deref())?;
        Ok(())
    }

    async fn handle(&self, capability: &Capability, context: &ExecutionContext) -> Result<HandlerOutcome> {
        let install = PackageInstall::from_capability(capability)?;
        let working_directory =
            validate_working_directory(capability.optional_string("working_directory")?.as_deref())?;
        let mut outcome = run_command(
            self.terminal.as_ref(),
            capability,
            context,
            &install.command(),
            &working_directory,
        )
        .await?;
        if let Some(Value::Object(map)) = outcome.result.as_mut() {
            map.insert("manager".to_string(), json!(install.manager));
            map.insert("packages".to_string(), json!(install.packages));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_policy::RiskLevel;
    use ag_store::LocalFs;

    #[test]
    fn whole_file_edit_spans_entire_content() {
        let edit = whole_file_edit("a\nbc\ndéf", "new".to_string());
        let out = ag_store::apply_edits("a\nbc\ndéf", &[edit]).unwrap();
        assert_eq!(out, "new");

        let edit = whole_file_edit("trailing\n", "x".to_string());
        assert_eq!(ag_store::apply_edits("trailing\n", &[edit]).unwrap(), "x");
    }

    #[test]
    fn terminal_commands_are_classified_for_policy() {
        struct Noop;
        #[async_trait]
        impl TerminalRunner for Noop {
            async fn surface(&self, _c: &str, _w: &Path) -> Result<()> {
                Ok(())
            }
            async fn run_captured(&self, _c: &str, _w: &Path) -> Result<crate::terminal::CommandOutput> {
                Err(ExecutorError::ExecutionFailed("unused".to_string()))
            }
        }
        let handler = TerminalCommandHandler::new(Arc::new(Noop));
        let rm = Capability::new("terminal_command", RiskLevel::Low, "clean")
            .with_param("command", "rm -rf target");
        assert_eq!(handler.operation_type(&rm), "terminal_recursive_remove");
        let ls = Capability::new("terminal_command", RiskLevel::Low, "list")
            .with_param("command", "ls");
        assert_eq!(handler.operation_type(&ls), "terminal_command");
    }

    #[tokio::test]
    async fn file_handlers_validate_paths_before_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(AtomicFileStore::new(Arc::new(LocalFs::new(tmp.path()).unwrap())));
        let handler = FileCreationHandler::new(store);
        let escaping = Capability::new("file_creation", RiskLevel::Low, "escape")
            .with_param("path", "../outside.txt")
            .with_param("content", "x");
        assert!(handler.validate(&escaping).is_err());
        let missing = Capability::new("file_creation", RiskLevel::Low, "no content")
            .with_param("path", "a.txt");
        assert!(handler.validate(&missing).is_err());
    }

    #[tokio::test]
    async fn overwriting_create_honours_backup_choice() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "v1").unwrap();
        let store = Arc::new(AtomicFileStore::new(Arc::new(LocalFs::new(tmp.path()).unwrap())));
        let handler = FileCreationHandler::new(store.clone());
        let overwrite = Capability::new("file_creation", RiskLevel::Low, "rewrite notes")
            .with_param("path", "notes.md")
            .with_param("content", "v2")
            .with_param("overwrite", true);

        let no_backup = ExecutionContext {
            create_backup: false,
            ..ExecutionContext::default()
        };
        let outcome = handler.handle(&overwrite, &no_backup).await.unwrap();
        assert_eq!(outcome.result.unwrap()["backup_created"], false);
        assert!(!store.has_backup("notes.md"));

        let outcome = handler
            .handle(&overwrite, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.result.unwrap()["backup_created"], true);
        assert_eq!(store.backup("notes.md").unwrap().content, "v2");
    }
}
