//! Artifact stores holding serialized model bytes

use async_trait::async_trait;
use modelship_core::LoadError;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Source of raw artifact bytes, addressed by location
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the artifact stored at `location`
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError>;

    /// Store name for logging
    fn name(&self) -> &'static str;
}

/// Artifacts on the local filesystem.
///
/// Locations may be absolute paths, `file://` URIs, or paths relative to the root.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a location to a filesystem path
    pub fn resolve(&self, location: &str) -> Result<PathBuf, LoadError> {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);

        if raw.is_empty() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(LoadError::Fetch {
                location: location.to_string(),
                reason: "location must be a non-empty path without '..'".to_string(),
            });
        }

        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.root.join(path))
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError> {
        let path = self.resolve(location)?;
        debug!(path = %path.display(), "Reading artifact");
        tokio::fs::read(&path).await.map_err(|e| LoadError::Fetch {
            location: location.to_string(),
            reason: e.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

/// In-memory artifacts, with a fetch counter and optional latency
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Store bytes at a location, replacing previous content
    pub fn put(&self, location: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut artifacts) = self.artifacts.write() {
            artifacts.insert(location.into(), bytes);
        }
    }

    /// Number of fetches served or attempted
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let artifacts = self.artifacts.read().map_err(|_| LoadError::Fetch {
            location: location.to_string(),
            reason: "artifact map poisoned".to_string(),
        })?;
        artifacts.get(location).cloned().ok_or_else(|| LoadError::Fetch {
            location: location.to_string(),
            reason: "no such artifact".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_locations() {
        let store = FsArtifactStore::new(PathBuf::from("/srv/artifacts"));
        assert_eq!(
            store.resolve("runs/abc/model.json").unwrap(),
            PathBuf::from("/srv/artifacts/runs/abc/model.json")
        );
        assert_eq!(
            store.resolve("file:///opt/m.json").unwrap(),
            PathBuf::from("/opt/m.json")
        );
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("").is_err());
    }

    #[tokio::test]
    async fn test_fs_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("runs")).unwrap();
        std::fs::write(dir.path().join("runs/model.json"), b"{}").unwrap();

        let store = FsArtifactStore::new(dir.path().to_path_buf());
        assert_eq!(store.fetch("runs/model.json").await.unwrap(), b"{}".to_vec());
        assert!(matches!(
            store.fetch("runs/missing.json").await,
            Err(LoadError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_counts_fetches() {
        let store = MemoryArtifactStore::new();
        store.put("a", vec![1, 2, 3]);
        assert_eq!(store.fetch("a").await.unwrap(), vec![1, 2, 3]);
        assert!(store.fetch("b").await.is_err());
        assert_eq!(store.fetch_count(), 2);
    }
}
