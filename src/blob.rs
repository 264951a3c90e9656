//! Opaque blob storage.
//!
//! The core never interprets a `BlobRef`; it only hands bytes to the store on
//! upload and reads them back for extraction and scanning. The filesystem
//! implementation shards by ref prefix to keep directories small.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque locator for stored bytes.
pub type BlobRef = String;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store_blob(&self, bytes: &[u8]) -> Result<BlobRef>;
    async fn read_blob(&self, blob_ref: &str) -> Result<Vec<u8>>;
}

/// Blob store backed by a local directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, blob_ref: &str) -> PathBuf {
        // Two-char shard prefix, e.g. ab/abcd-....bin
        let shard = &blob_ref[..2.min(blob_ref.len())];
        self.root.join(shard).join(format!("{}.bin", blob_ref))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store_blob(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob_ref = Uuid::new_v4().to_string();
        let path = self.path_for(&blob_ref);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating blob dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(blob_ref)
    }

    async fn read_blob(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob_ref);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }
}
