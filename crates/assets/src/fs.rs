//! Content-addressed filesystem asset store.
//!
//! Layout: `<root>/<hh>/<sha256>` with a `.mime` sidecar. Writes go
//! through a tempfile in the same directory and a rename, so readers
//! never observe a partial asset.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use cf_domain::error::{Error, Result};

use crate::{AssetData, AssetStore, SavedAsset};

pub struct FsAssetStore {
    root: PathBuf,
    id: String,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            id: "fs".into(),
        }
    }

    fn paths_for(&self, asset_id: &str) -> Result<(PathBuf, PathBuf)> {
        // Asset ids are hex digests; refuse anything path-like.
        if asset_id.len() < 3 || !asset_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Asset(format!("malformed asset id {asset_id:?}")));
        }
        let dir = self.root.join(&asset_id[..2]);
        let data = dir.join(asset_id);
        let mime = dir.join(format!("{asset_id}.mime"));
        Ok((data, mime))
    }
}

#[async_trait::async_trait]
impl AssetStore for FsAssetStore {
    async fn save(&self, bytes: &[u8], mime: &str) -> Result<SavedAsset> {
        let asset_id = hex::encode(Sha256::digest(bytes));
        let (data_path, mime_path) = self.paths_for(&asset_id)?;
        let dir = data_path
            .parent()
            .expect("content-addressed paths have a parent");

        if tokio::fs::try_exists(&data_path).await.unwrap_or(false) {
            return Ok(SavedAsset {
                asset_id,
                size: bytes.len() as u64,
            });
        }

        tokio::fs::create_dir_all(dir).await?;
        atomic_write(dir, &data_path, bytes).await?;
        atomic_write(dir, &mime_path, mime.as_bytes()).await?;

        Ok(SavedAsset {
            asset_id,
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, asset_id: &str) -> Result<AssetData> {
        let (data_path, mime_path) = self.paths_for(asset_id)?;
        let bytes = tokio::fs::read(&data_path)
            .await
            .map_err(|e| Error::Asset(format!("asset {asset_id} unreadable: {e}")))?;
        let mime = tokio::fs::read_to_string(&mime_path)
            .await
            .unwrap_or_else(|_| "application/octet-stream".into());
        Ok(AssetData {
            bytes,
            mime: mime.trim().to_string(),
        })
    }

    fn store_id(&self) -> &str {
        &self.id
    }
}

/// Write via tempfile + rename in the target directory.
async fn atomic_write(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::fs::write(tmp.path(), &bytes)?;
        tmp.persist(&target)
            .map_err(|e| Error::Asset(format!("persist failed: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Other(format!("blocking write task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());

        let saved = store.save(b"hello bytes", "text/plain").await.unwrap();
        assert_eq!(saved.size, 11);

        let data = store.get(&saved.asset_id).await.unwrap();
        assert_eq!(data.bytes, b"hello bytes");
        assert_eq!(data.mime, "text/plain");
    }

    #[tokio::test]
    async fn save_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());

        let a = store.save(b"same", "text/plain").await.unwrap();
        let b = store.save(b"same", "text/plain").await.unwrap();
        let c = store.save(b"different", "text/plain").await.unwrap();
        assert_eq!(a.asset_id, b.asset_id);
        assert_ne!(a.asset_id, c.asset_id);
    }

    #[tokio::test]
    async fn rejects_path_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("zz").await.is_err());
    }

    #[tokio::test]
    async fn missing_asset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());
        let err = store.get(&"a".repeat(64)).await.unwrap_err();
        assert!(matches!(err, Error::Asset(_)));
    }
}
