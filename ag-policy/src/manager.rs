use crate::error::{PolicyError, Result};
use crate::matrix::{
    CategoryFlags, MODE_KEY, OperationCategory, PolicyMatrix, SETTING_PREFIX, flag_for,
    is_destructive, setting_key,
};
use crate::mode::{AutonomyMode, ModeTransition, RiskLevel};
use crate::settings::SettingsStore;
use serde::Serialize;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize)]
pub struct OperationSettings {
    pub category: OperationCategory,
    pub flags: CategoryFlags,
}

#[derive(Debug, Clone)]
struct PolicyState {
    mode: AutonomyMode,
    matrix: PolicyMatrix,
}

impl PolicyState {
    fn for_mode(mode: AutonomyMode) -> Self {
        Self {
            mode,
            matrix: PolicyMatrix::for_mode(mode),
        }
    }
}

/// Autonomy mode plus the per-category auto-execute matrix.
///
/// Reads never wait on persistence. Writes persist first and only then apply, so a
/// failed save leaves the active policy unchanged.
pub struct PolicyManager {
    state: RwLock<PolicyState>,
    settings: Arc<dyn SettingsStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl PolicyManager {
    /// Loads mode and flag overrides from `settings`. Any failure falls back to
    /// collaborative mode with every flag off.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn load(settings: Arc<dyn SettingsStore>) -> Self {
        let state = match Self::read_state(settings.as_ref()).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "policy settings unavailable, using safe defaults");
                PolicyState::for_mode(AutonomyMode::Collaborative)
            }
        };
        tracing::info!(mode = %state.mode, "policy loaded");
        Self {
            state: RwLock::new(state),
            settings,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_state(settings: &dyn SettingsStore) -> Result<PolicyState> {
        let entries = settings.entries().await?;
        let mode = match entries.get(MODE_KEY) {
            Some(raw) => raw.parse::<AutonomyMode>()?,
            None => AutonomyMode::Collaborative,
        };
        let mut state = PolicyState::for_mode(mode);
        let rejected = state.matrix.apply_entries(&entries);
        if !rejected.is_empty() {
            tracing::warn!(keys = ?rejected, "ignoring unrecognized policy settings");
        }
        Ok(state)
    }

    pub fn mode(&self) -> AutonomyMode {
        self.snapshot().mode
    }

    pub fn matrix(&self) -> PolicyMatrix {
        self.snapshot().matrix
    }

    fn snapshot(&self) -> PolicyState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(_) => PolicyState::for_mode(AutonomyMode::Collaborative),
        }
    }

    /// Switches mode, replacing the whole matrix with that mode's defaults. Persisted flags
    /// outside the new defaults are dropped so a reload sees the same matrix.
    #[tracing::instrument(level = "info", skip_all, fields(mode = %mode))]
    pub async fn set_mode(&self, mode: AutonomyMode) -> Result<ModeTransition> {
        let _write = self.write_lock.lock().await;
        let previous = self.mode();
        let next = PolicyState::for_mode(mode);

        let mut entries = next.matrix.to_entries();
        entries.insert(MODE_KEY.to_string(), mode.as_str().to_string());
        self.settings
            .replace_prefix(SETTING_PREFIX, &entries)
            .await
            .map_err(|e| PolicyError::Persist(e.to_string()))?;

        self.replace_state(next)?;
        let transition = ModeTransition {
            previous,
            current: mode,
        };
        tracing::info!(
            previous = %transition.previous,
            current = %transition.current,
            "autonomy mode set"
        );
        Ok(transition)
    }

    /// Parses `mode` and switches to it.
    pub async fn set_mode_named(&self, mode: &str) -> Result<ModeTransition> {
        let mode = mode.parse::<AutonomyMode>()?;
        self.set_mode(mode).await
    }

    pub async fn toggle_mode(&self) -> Result<ModeTransition> {
        let next = self.mode().toggled();
        self.set_mode(next).await
    }

    /// High risk first, then the destructive set, then mode: autonomous allows, collaborative
    /// consults the category flag and fails closed when there is none.
    pub fn requires_approval(&self, operation_type: &str, risk: RiskLevel) -> bool {
        if risk == RiskLevel::High {
            return true;
        }
        if is_destructive(operation_type) {
            return true;
        }
        let state = self.snapshot();
        match state.mode {
            AutonomyMode::Autonomous => false,
            AutonomyMode::Collaborative => !state.matrix.auto_execute(operation_type).unwrap_or(false),
        }
    }

    pub fn operation_settings(&self, operation_type: &str) -> OperationSettings {
        let category = OperationCategory::of(operation_type);
        OperationSettings {
            category,
            flags: self.snapshot().matrix.category(category),
        }
    }

    /// Sets one auto-execute flag and persists it. Destructive operations cannot be
    /// allowed.
    #[tracing::instrument(level = "info", skip_all, fields(operation_type = %operation_type, allowed = allowed))]
    pub async fn set_auto_execute(&self, operation_type: &str, allowed: bool) -> Result<()> {
        if allowed && is_destructive(operation_type) {
            return Err(PolicyError::InvalidSetting(format!(
                "{operation_type} is destructive and always requires approval"
            )));
        }
        let (category, flag) = flag_for(operation_type);
        let _write = self.write_lock.lock().await;
        self.settings
            .set(&setting_key(category, flag), &allowed.to_string())
            .await
            .map_err(|e| PolicyError::Persist(e.to_string()))?;

        let mut next = self.snapshot();
        next.matrix.set_flag(category, flag, allowed);
        self.replace_state(next)?;
        tracing::info!(category = %category, flag, allowed, "auto-execute flag updated");
        Ok(())
    }

    fn replace_state(&self, next: PolicyState) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| PolicyError::Settings("policy state lock poisoned".to_string()))?;
        *state = next;
        Ok(())
    }
}
