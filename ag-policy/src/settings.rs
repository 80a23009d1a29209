use crate::error::{PolicyError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Flat string key/value persistence for policy settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn entries(&self) -> Result<BTreeMap<String, String>>;

    /// Writes every entry in one step.
    async fn set_many(&self, entries: &BTreeMap<String, String>) -> Result<()>;

    /// Drops every key starting with `prefix`, then writes `entries`, in one step.
    async fn replace_prefix(&self, prefix: &str, entries: &BTreeMap<String, String>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = BTreeMap::new();
        entries.insert(key.to_string(), value.to_string());
        self.set_many(&entries).await
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .map_err(|_| PolicyError::Settings("settings lock poisoned".to_string()))
    }

    async fn set_many(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut current = self
            .entries
            .lock()
            .map_err(|_| PolicyError::Settings("settings lock poisoned".to_string()))?;
        current.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn replace_prefix(&self, prefix: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut current = self
            .entries
            .lock()
            .map_err(|_| PolicyError::Settings("settings lock poisoned".to_string()))?;
        current.retain(|k, _| !k.starts_with(prefix));
        current.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Settings kept as a flat TOML table of strings. A missing file reads as empty.
pub struct TomlSettingsStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, String>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(PolicyError::Settings(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        toml::from_str(&contents)
            .map_err(|e| PolicyError::Settings(format!("parse {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl SettingsStore for TomlSettingsStore {
    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        self.read().await
    }

    async fn set_many(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.read().await?;
        current.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write(&current).await?;
        tracing::debug!(path = %self.path.display(), keys = entries.len(), "settings saved");
        Ok(())
    }

    async fn replace_prefix(&self, prefix: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.read().await?;
        let before = current.len();
        current.retain(|k, _| !k.starts_with(prefix));
        let dropped = before - current.len();
        current.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write(&current).await?;
        tracing::debug!(path = %self.path.display(), prefix, dropped, keys = entries.len(), "settings replaced");
        Ok(())
    }
}

impl TomlSettingsStore {
    async fn write(&self, current: &BTreeMap<String, String>) -> Result<()> {
        let content = toml::to_string_pretty(current)
            .map_err(|e| PolicyError::Persist(format!("serialize settings: {e}")))?;
        write_atomic(&self.path, content.as_bytes())
            .await
            .map_err(|e| PolicyError::Persist(format!("write {}: {e}", self.path.display())))
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "settings".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
