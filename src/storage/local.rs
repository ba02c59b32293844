/// Local filesystem blob store.
///
/// Objects live under a root directory with the locator as the relative
/// path. Writes go through a temp file and rename, so a crash mid-write
/// never leaves a truncated object under the final name.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::BlobStore;
use crate::error::{Result, VaultError};

pub struct LocalFsStore {
    name: String,
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }
}

#[async_trait]
impl BlobStore for LocalFsStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(locator);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VaultError::Upload(format!("{}: mkdir: {e}", self.name)))?;
        }

        let tmp = path.with_extension("enc.tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|e| VaultError::Upload(format!("{}: write {locator}: {e}", self.name)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| VaultError::Upload(format!("{}: rename {locator}: {e}", self.name)))?;
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.object_path(locator);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(format!("blob {locator} in {}", self.name)))
            }
            Err(e) => Err(VaultError::Download(format!(
                "{}: read {locator}: {e}",
                self.name
            ))),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(locator))
            .await
            .map_err(|e| VaultError::Download(format!("{}: stat {locator}: {e}", self.name)))?)
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        match fs::remove_file(self.object_path(locator)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::Upload(format!(
                "{}: delete {locator}: {e}",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new("primary", dir.path());

        store.put("user_1/a.txt.v1.enc", b"ciphertext").await.unwrap();
        assert_eq!(store.get("user_1/a.txt.v1.enc").await.unwrap(), b"ciphertext");
        assert!(store.exists("user_1/a.txt.v1.enc").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new("primary", dir.path());
        let err = store.get("user_1/ghost.v1.enc").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new("primary", dir.path());

        store.put("user_1/a.v1.enc", b"x").await.unwrap();
        assert!(store.delete("user_1/a.v1.enc").await.unwrap());
        assert!(!store.delete("user_1/a.v1.enc").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new("secondary", dir.path());

        store.put("k", b"old").await.unwrap();
        store.put("k", b"new").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"new");
    }
}
