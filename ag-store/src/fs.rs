use crate::error::{Result, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One instruction inside a [`WorkspaceEdit`]. Paths are workspace-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Create {
        path: PathBuf,
        content: String,
        overwrite: bool,
    },
    Replace {
        path: PathBuf,
        content: String,
    },
    Delete {
        path: PathBuf,
        recursive: bool,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        overwrite: bool,
    },
}

impl FileChange {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
            Self::Rename { .. } => "rename",
        }
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Create { path, .. } | Self::Replace { path, .. } | Self::Delete { path, .. } => {
                vec![path.as_path()]
            }
            Self::Rename { from, to, .. } => vec![from.as_path(), to.as_path()],
        }
    }
}

/// A set of file changes applied as one unit: either every change lands or none do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceEdit {
    changes: Vec<FileChange>,
}

impl WorkspaceEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        mut self,
        path: impl Into<PathBuf>,
        content: impl Into<String>,
        overwrite: bool,
    ) -> Self {
        self.changes.push(FileChange::Create {
            path: path.into(),
            content: content.into(),
            overwrite,
        });
        self
    }

    pub fn replace(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.changes.push(FileChange::Replace {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    pub fn delete(mut self, path: impl Into<PathBuf>, recursive: bool) -> Self {
        self.changes.push(FileChange::Delete {
            path: path.into(),
            recursive,
        });
        self
    }

    pub fn rename(mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>, overwrite: bool) -> Self {
        self.changes.push(FileChange::Rename {
            from: from.into(),
            to: to.into(),
            overwrite,
        });
        self
    }

    pub fn push(&mut self, change: FileChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub is_dir: bool,
    pub len: u64,
}

/// File system the store mutates.
///
/// `apply` returns `Ok(false)` when the edit is rejected before anything is touched
/// (a precondition failed) and `Err` when a change failed midway; in both cases no
/// change from the edit remains applied.
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    async fn apply(&self, edit: &WorkspaceEdit) -> Result<bool>;
    async fn read_text(&self, path: &Path) -> Result<String>;
    async fn stat(&self, path: &Path) -> Result<Option<EntryInfo>>;

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}

/// Normalizes a workspace-relative path, rejecting absolute paths and traversal.
pub fn workspace_key(path: impl AsRef<Path>) -> Result<PathBuf> {
    let rel = path.as_ref();
    if rel.as_os_str().is_empty() {
        return Err(StoreError::Validation("path must not be empty".to_string()));
    }
    if rel.is_absolute() {
        return Err(StoreError::Unauthorized(
            "absolute paths are not allowed".to_string(),
        ));
    }

    let mut key = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(StoreError::Unauthorized(
                    "path traversal is not allowed".to_string(),
                ));
            }
            Component::CurDir => {}
            Component::Normal(part) => key.push(part),
            Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::Unauthorized("invalid path".to_string()));
            }
        }
    }
    if key.as_os_str().is_empty() {
        return Err(StoreError::Validation(format!(
            "path {} does not name a file",
            rel.display()
        )));
    }
    Ok(key)
}

/// Local disk implementation rooted at a workspace directory.
pub struct LocalFs {
    root_dir: PathBuf,
}

enum Undo {
    RemoveFile(PathBuf),
    RestoreParked { parked: PathBuf, original: PathBuf },
    RenameBack { from: PathBuf, to: PathBuf },
}

impl LocalFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(StoreError::Validation("root_dir is required".to_string()));
        }
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root_dir.join(workspace_key(path)?))
    }

    fn resolve_change(&self, change: &FileChange) -> Result<FileChange> {
        Ok(match change {
            FileChange::Create {
                path,
                content,
                overwrite,
            } => FileChange::Create {
                path: self.resolve(path)?,
                content: content.clone(),
                overwrite: *overwrite,
            },
            FileChange::Replace { path, content } => FileChange::Replace {
                path: self.resolve(path)?,
                content: content.clone(),
            },
            FileChange::Delete { path, recursive } => FileChange::Delete {
                path: self.resolve(path)?,
                recursive: *recursive,
            },
            FileChange::Rename {
                from,
                to,
                overwrite,
            } => FileChange::Rename {
                from: self.resolve(from)?,
                to: self.resolve(to)?,
                overwrite: *overwrite,
            },
        })
    }

    /// Walks the edit against a virtual view of the disk and returns the first reason
    /// it cannot apply, if any.
    async fn precheck(&self, changes: &[FileChange]) -> Result<Option<String>> {
        let mut overlay: HashMap<PathBuf, Option<bool>> = HashMap::new();
        for change in changes {
            match change {
                FileChange::Create {
                    path, overwrite, ..
                } => {
                    match overlay_stat(&overlay, path).await? {
                        Some(true) => {
                            return Ok(Some(format!("{} is a directory", path.display())));
                        }
                        Some(false) if !overwrite => {
                            return Ok(Some(format!("{} already exists", path.display())));
                        }
                        _ => {}
                    }
                    overlay.insert(path.clone(), Some(false));
                }
                FileChange::Replace { path, .. } => {
                    match overlay_stat(&overlay, path).await? {
                        Some(false) => {}
                        Some(true) => {
                            return Ok(Some(format!("{} is a directory", path.display())));
                        }
                        None => return Ok(Some(format!("{} does not exist", path.display()))),
                    }
                    overlay.insert(path.clone(), Some(false));
                }
                FileChange::Delete { path, recursive } => {
                    match overlay_stat(&overlay, path).await? {
                        None => return Ok(Some(format!("{} does not exist", path.display()))),
                        Some(true) if !recursive => {
                            return Ok(Some(format!(
                                "{} is a directory; recursive delete required",
                                path.display()
                            )));
                        }
                        _ => {}
                    }
                    overlay.insert(path.clone(), None);
                }
                FileChange::Rename {
                    from,
                    to,
                    overwrite,
                } => {
                    let Some(source_is_dir) = overlay_stat(&overlay, from).await? else {
                        return Ok(Some(format!("{} does not exist", from.display())));
                    };
                    match overlay_stat(&overlay, to).await? {
                        Some(true) => {
                            return Ok(Some(format!("{} is a directory", to.display())));
                        }
                        Some(false) if !overwrite => {
                            return Ok(Some(format!("{} already exists", to.display())));
                        }
                        _ => {}
                    }
                    overlay.insert(from.clone(), None);
                    overlay.insert(to.clone(), Some(source_is_dir));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkspaceFs for LocalFs {
    #[tracing::instrument(level = "debug", skip_all, fields(changes = edit.len()))]
    async fn apply(&self, edit: &WorkspaceEdit) -> Result<bool> {
        let changes = edit
            .changes()
            .iter()
            .map(|c| self.resolve_change(c))
            .collect::<Result<Vec<_>>>()?;

        if let Some(reason) = self.precheck(&changes).await? {
            tracing::warn!(reason = %reason, "workspace edit rejected");
            return Ok(false);
        }

        let mut journal = Vec::new();
        for change in &changes {
            if let Err(e) = apply_change(change, &mut journal).await {
                tracing::error!(
                    error = %e,
                    change = change.label(),
                    applied = journal.len(),
                    "workspace edit failed, undoing applied changes"
                );
                undo(journal).await;
                return Err(StoreError::Execution(format!("{} failed: {e}", change.label())));
            }
        }
        commit(journal).await;
        Ok(true)
    }

    async fn read_text(&self, path: &Path) -> Result<String> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved).await?;
        String::from_utf8(bytes).map_err(|_| {
            StoreError::Validation(format!("{} is not valid UTF-8", path.display()))
        })
    }

    async fn stat(&self, path: &Path) -> Result<Option<EntryInfo>> {
        let resolved = self.resolve(path)?;
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) => Ok(Some(EntryInfo {
                is_dir: meta.is_dir(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn overlay_stat(overlay: &HashMap<PathBuf, Option<bool>>, path: &Path) -> Result<Option<bool>> {
    if let Some(state) = overlay.get(path) {
        return Ok(*state);
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.is_dir())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn apply_change(change: &FileChange, journal: &mut Vec<Undo>) -> std::io::Result<()> {
    match change {
        FileChange::Create { path, content, .. } | FileChange::Replace { path, content } => {
            if path_exists(path).await? {
                let parked = park(path).await?;
                journal.push(Undo::RestoreParked {
                    parked,
                    original: path.clone(),
                });
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            atomic_write(path, content.as_bytes()).await?;
            journal.push(Undo::RemoveFile(path.clone()));
        }
        FileChange::Delete { path, .. } => {
            let parked = park(path).await?;
            journal.push(Undo::RestoreParked {
                parked,
                original: path.clone(),
            });
        }
        FileChange::Rename { from, to, .. } => {
            if path_exists(to).await? {
                let parked = park(to).await?;
                journal.push(Undo::RestoreParked {
                    parked,
                    original: to.clone(),
                });
            }
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(from, to).await?;
            journal.push(Undo::RenameBack {
                from: to.clone(),
                to: from.clone(),
            });
        }
    }
    Ok(())
}

async fn undo(journal: Vec<Undo>) {
    for step in journal.into_iter().rev() {
        let outcome = match &step {
            Undo::RemoveFile(path) => tokio::fs::remove_file(path).await,
            Undo::RestoreParked { parked, original } => tokio::fs::rename(parked, original).await,
            Undo::RenameBack { from, to } => tokio::fs::rename(from, to).await,
        };
        if let Err(e) = outcome {
            tracing::error!(error = %e, "failed to undo workspace change");
        }
    }
}

async fn commit(journal: Vec<Undo>) {
    for step in journal {
        let Undo::RestoreParked { parked, .. } = step else {
            continue;
        };
        let outcome = match tokio::fs::metadata(&parked).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&parked).await,
            Ok(_) => tokio::fs::remove_file(&parked).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::warn!(
                error = %e,
                parked = %parked.display(),
                "failed to discard parked entry after workspace edit"
            );
        }
    }
}

async fn path_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Moves an entry aside so it can be restored if a later change in the edit fails.
async fn park(path: &Path) -> std::io::Result<PathBuf> {
    let parked = scratch_path(path, "parked")?;
    tokio::fs::rename(path, &parked).await?;
    Ok(parked)
}

fn scratch_path(path: &Path, tag: &str) -> std::io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let name = format!(
        ".{}.{tag}-{}-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("entry"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed),
    );
    Ok(parent.join(name))
}

async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = scratch_path(path, "tmp")?;
    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_key_rejects_traversal_and_absolute_paths() {
        let err = workspace_key("../secrets.txt").unwrap_err();
        assert!(err.to_string().contains("traversal"));
        let err = workspace_key("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("absolute"));
        assert!(workspace_key("").is_err());
        assert!(workspace_key(".").is_err());
    }

    #[test]
    fn workspace_key_drops_current_dir_components() {
        let key = workspace_key("./src/./main.rs").unwrap();
        assert_eq!(key, PathBuf::from("src/main.rs"));
    }

    #[tokio::test]
    async fn apply_creates_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();
        let edit = WorkspaceEdit::new().create("a/b/c.txt", "hello", false);
        assert!(fs.apply(&edit).await.unwrap());
        let content = tokio::fs::read_to_string(tmp.path().join("a/b/c.txt"))
            .await
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn apply_rejects_whole_edit_when_any_precondition_fails() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("taken.txt"), "old").await.unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();

        let edit = WorkspaceEdit::new()
            .create("fresh.txt", "new", false)
            .create("taken.txt", "clobber", false);
        assert!(!fs.apply(&edit).await.unwrap());

        assert!(!tmp.path().join("fresh.txt").exists());
        let kept = tokio::fs::read_to_string(tmp.path().join("taken.txt"))
            .await
            .unwrap();
        assert_eq!(kept, "old");
    }

    #[tokio::test]
    async fn apply_sees_earlier_changes_in_the_same_edit() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a.txt"), "a").await.unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();

        let edit = WorkspaceEdit::new()
            .rename("a.txt", "b.txt", false)
            .replace("b.txt", "b");
        assert!(fs.apply(&edit).await.unwrap());
        assert!(!tmp.path().join("a.txt").exists());
        let content = tokio::fs::read_to_string(tmp.path().join("b.txt"))
            .await
            .unwrap();
        assert_eq!(content, "b");
    }

    #[tokio::test]
    async fn apply_replaces_and_deletes_without_leaving_scratch_files() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("keep.txt"), "v1").await.unwrap();
        tokio::fs::write(tmp.path().join("gone.txt"), "bye").await.unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();

        let edit = WorkspaceEdit::new()
            .replace("keep.txt", "v2")
            .delete("gone.txt", false);
        assert!(fs.apply(&edit).await.unwrap());

        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(tmp.path()).await.unwrap();
        while let Some(entry) = rd.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn delete_directory_requires_recursive_flag() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("dir/inner")).await.unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();

        assert!(!fs.apply(&WorkspaceEdit::new().delete("dir", false)).await.unwrap());
        assert!(fs.apply(&WorkspaceEdit::new().delete("dir", true)).await.unwrap());
        assert!(!tmp.path().join("dir").exists());
    }

    #[tokio::test]
    async fn read_text_rejects_binary_content() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("blob.bin"), [0xff, 0xfe, 0x00])
            .await
            .unwrap();
        let fs = LocalFs::new(tmp.path()).unwrap();
        let err = fs.read_text(Path::new("blob.bin")).await.unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }
}
