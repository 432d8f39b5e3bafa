//! Storage backends resolving stage inputs and outputs.
//!
//! Paths are storage-relative strings such as `srtm/N50E007.tif_max_0.3`.
//! [`LocalStorage`] maps them under a directory; [`HttpStorage`] checks a
//! remote file service and downloads into a local cache on first use.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use terraplan_core::PlanError;
use tracing::{debug, info};

#[async_trait]
pub trait StorageResolver: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, PlanError>;

    /// Local filesystem path holding the file, fetching it if needed.
    async fn resolve_local(&self, path: &str) -> Result<PathBuf, PlanError>;
}

/// Join a storage path under `root`, refusing anything that escapes it.
fn join_under(root: &Path, path: &str) -> Result<PathBuf, PlanError> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PlanError::config(format!("invalid storage path '{}'", path)));
    }
    Ok(root.join(relative))
}

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` at a storage path, creating parent directories.
    pub async fn write(&self, path: &str, contents: &[u8]) -> Result<PathBuf, PlanError> {
        let target = join_under(&self.root, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlanError::stage("storage", e))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| PlanError::stage("storage", e))?;
        Ok(target)
    }
}

#[async_trait]
impl StorageResolver for LocalStorage {
    async fn exists(&self, path: &str) -> Result<bool, PlanError> {
        let target = join_under(&self.root, path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| PlanError::stage("storage", e))
    }

    async fn resolve_local(&self, path: &str) -> Result<PathBuf, PlanError> {
        let target = join_under(&self.root, path)?;
        if !tokio::fs::try_exists(&target)
            .await
            .map_err(|e| PlanError::stage("storage", e))?
        {
            return Err(PlanError::stage(
                "storage",
                format!("{} not found under {}", path, self.root.display()),
            ));
        }
        Ok(target)
    }
}

/// Remote file service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
    cache: LocalStorage,
}

impl HttpStorage {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: LocalStorage::new(cache_dir),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageResolver for HttpStorage {
    async fn exists(&self, path: &str) -> Result<bool, PlanError> {
        if self.cache.exists(path).await? {
            return Ok(true);
        }
        let response = self
            .client
            .head(self.url(path))
            .send()
            .await
            .map_err(|e| PlanError::stage("storage", e))?;
        Ok(response.status().is_success())
    }

    async fn resolve_local(&self, path: &str) -> Result<PathBuf, PlanError> {
        if self.cache.exists(path).await? {
            debug!(path, "Serving from local cache");
            return self.cache.resolve_local(path).await;
        }

        info!(path, "Downloading from remote storage");
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PlanError::stage("storage", e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PlanError::stage("storage", e))?;

        self.cache.write(path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(!storage.exists("a/b.tif").await.unwrap());
        storage.write("a/b.tif", b"raster").await.unwrap();
        assert!(storage.exists("a/b.tif").await.unwrap());

        let local = storage.resolve_local("/a/b.tif").await.unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"raster");
    }

    #[tokio::test]
    async fn paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(matches!(
            storage.exists("../etc/passwd").await,
            Err(PlanError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.resolve_local("nothing").await.is_err());
    }

    #[test]
    fn http_urls_are_joined() {
        let storage = HttpStorage::new("http://files.local/", "/tmp/cache");
        assert_eq!(storage.url("/srtm/a.tif"), "http://files.local/srtm/a.tif");
    }
}
