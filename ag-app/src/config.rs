//! agentgate configuration loader.

use ag_policy::AutonomyMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentGateConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    /// Workspace root. Default: the current directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Policy settings file. Default: `~/.agentgate/settings.toml`.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
    /// Mode to switch to at startup; unset keeps the persisted mode.
    #[serde(default)]
    pub mode: Option<AutonomyMode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backup_max_bytes")]
    pub backup_max_bytes: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup_max_bytes: default_backup_max_bytes(),
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_recent_records")]
    pub recent_records: usize,
    #[serde(default = "default_max_detail_rounds")]
    pub max_detail_rounds: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            recent_records: default_recent_records(),
            max_detail_rounds: default_max_detail_rounds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_terminal_timeout_secs")]
    pub timeout_secs: u64,
    /// Run commands and capture output instead of surfacing them.
    #[serde(default)]
    pub capture: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_terminal_timeout_secs(),
            capture: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_collaborative_timeout_secs")]
    pub collaborative_timeout_secs: u64,
    #[serde(default = "default_autonomous_timeout_secs")]
    pub autonomous_timeout_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            collaborative_timeout_secs: default_collaborative_timeout_secs(),
            autonomous_timeout_secs: default_autonomous_timeout_secs(),
        }
    }
}

impl ConfirmationConfig {
    pub fn timeout_for(&self, mode: AutonomyMode) -> Duration {
        match mode {
            AutonomyMode::Collaborative => Duration::from_secs(self.collaborative_timeout_secs),
            AutonomyMode::Autonomous => Duration::from_secs(self.autonomous_timeout_secs),
        }
    }
}

fn default_backup_max_bytes() -> u64 {
    ag_store::DEFAULT_BACKUP_MAX_BYTES
}

fn default_history_capacity() -> usize {
    100
}

fn default_recent_records() -> usize {
    10
}

fn default_max_detail_rounds() -> usize {
    8
}

fn default_terminal_timeout_secs() -> u64 {
    120
}

fn default_collaborative_timeout_secs() -> u64 {
    30
}

fn default_autonomous_timeout_secs() -> u64 {
    5
}

impl AgentGateConfig {
    /// Loads `path`, or the default path when `None`. A missing default file yields the
    /// built-in defaults; a missing explicit file is an error.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies `AGENTGATE_WORKSPACE` and `AGENTGATE_MODE` as read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("AGENTGATE_WORKSPACE") {
            if !v.trim().is_empty() {
                self.general.workspace = Some(PathBuf::from(v.trim()));
            }
        }
        if let Some(v) = lookup("AGENTGATE_MODE") {
            if !v.trim().is_empty() {
                let mode = v
                    .parse::<AutonomyMode>()
                    .map_err(|e| anyhow::anyhow!("AGENTGATE_MODE: {e}"))?;
                self.general.mode = Some(mode);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.history_capacity == 0 {
            return Err(anyhow::anyhow!("store.history_capacity must be > 0"));
        }
        if self.executor.history_capacity == 0 {
            return Err(anyhow::anyhow!("executor.history_capacity must be > 0"));
        }
        if self.executor.max_detail_rounds == 0 {
            return Err(anyhow::anyhow!("executor.max_detail_rounds must be > 0"));
        }
        if self.terminal.timeout_secs == 0 {
            return Err(anyhow::anyhow!("terminal.timeout_secs must be > 0"));
        }
        if self.confirmation.collaborative_timeout_secs == 0
            || self.confirmation.autonomous_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("confirmation timeouts must be > 0"));
        }
        Ok(())
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.general
            .workspace
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.general
            .settings_path
            .clone()
            .unwrap_or_else(default_settings_path)
    }
}

fn home_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".agentgate")
}

pub fn default_config_path() -> PathBuf {
    home_dir().join("config.toml")
}

pub fn default_settings_path() -> PathBuf {
    home_dir().join("settings.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = AgentGateConfig::parse("").unwrap();
        assert_eq!(cfg.store.backup_max_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.confirmation.collaborative_timeout_secs, 30);
        assert_eq!(
            cfg.confirmation.timeout_for(AutonomyMode::Autonomous),
            Duration::from_secs(5)
        );
        assert!(!cfg.terminal.capture);
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = AgentGateConfig::parse(
            r#"
[general]
workspace = "/srv/project"
mode = "autonomous"

[terminal]
timeout_secs = 10
capture = true

[executor]
max_detail_rounds = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.workspace_dir(), PathBuf::from("/srv/project"));
        assert_eq!(cfg.general.mode, Some(AutonomyMode::Autonomous));
        assert!(cfg.terminal.capture);
        assert_eq!(cfg.executor.max_detail_rounds, 2);
        assert_eq!(cfg.executor.history_capacity, 100);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGENTGATE_WORKSPACE", "/tmp/ws"),
            ("AGENTGATE_MODE", "Collaborative"),
        ]);
        let mut cfg = AgentGateConfig::parse("[general]\nmode = \"autonomous\"").unwrap();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.workspace_dir(), PathBuf::from("/tmp/ws"));
        assert_eq!(cfg.general.mode, Some(AutonomyMode::Collaborative));

        let mut cfg = AgentGateConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "AGENTGATE_MODE").then(|| "reckless".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AGENTGATE_MODE"));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cfg = AgentGateConfig::parse("[terminal]\ntimeout_secs = 0").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = AgentGateConfig::load(Some(tmp.path().join("nope.toml")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read config"));
    }
}
