//! Filesystem-backed object store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::ObjectStore;
use crate::error::{EngineError, Result};

/// Object store rooted at a local directory. URIs are slash-separated
/// relative paths under the root.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        if uri.is_empty() || uri.starts_with('/') || uri.split('/').any(|seg| seg == "..") {
            return Err(EngineError::Config(format!("invalid object uri: {uri}")));
        }
        Ok(self.root.join(uri))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ObjectNotFound(uri.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, uri: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(uri)?;
        Self::ensure_parent(&path).await?;
        // Unique temp name so concurrent attempts never clobber each
        // other's partial writes.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        debug!(uri, bytes = data.len(), "object written");
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst).await?;
        match fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ObjectNotFound(from.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        let path = self.resolve(uri)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .map_err(|_| EngineError::Internal("path outside store root".into()))?;
                let uri = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                if uri.starts_with(prefix) && !uri.contains(".tmp-") {
                    results.push(uri);
                }
            }
        }
        results.sort();
        Ok(results)
    }
}
