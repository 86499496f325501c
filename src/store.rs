use crate::error::CaptureError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Opaque reference to persisted snapshot content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(pub String);

impl SnapshotRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, target_id: &str, content: &[u8]) -> Result<SnapshotRef, CaptureError>;
}

/// Writes each snapshot to `<root>/<target>-<uuid>.html`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(target_id: &str) -> String {
        let safe: String = target_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}-{}.html", safe, uuid::Uuid::new_v4())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn persist(&self, target_id: &str, content: &[u8]) -> Result<SnapshotRef, CaptureError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CaptureError::Storage(format!("cannot create {}: {e}", self.root.display())))?;

        let path = self.root.join(Self::file_name(target_id));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| CaptureError::Storage(format!("cannot write {}: {e}", path.display())))?;

        debug!("Stored snapshot for {} at {}", target_id, path.display());
        Ok(SnapshotRef(path.display().to_string()))
    }
}

/// Keeps snapshots in memory, keyed by reference
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<SnapshotRef, Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, snapshot: &SnapshotRef) -> Option<Vec<u8>> {
        self.snapshots.get(snapshot).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn persist(&self, target_id: &str, content: &[u8]) -> Result<SnapshotRef, CaptureError> {
        let snapshot = SnapshotRef(format!("mem://{}/{}", target_id, uuid::Uuid::new_v4()));
        self.snapshots.insert(snapshot.clone(), content.to_vec());
        Ok(snapshot)
    }
}
