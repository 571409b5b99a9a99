//! Filesystem object store rooted at the configured data directory:
//! `{data_dir}/{bucket}/{key}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use driftnet_core::CrawlError;

use crate::ObjectStore;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf, CrawlError> {
        // Keys come from normalized domains and hex hashes; reject anything
        // that could escape the root.
        if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(CrawlError::Storage(format!("unsafe object key {:?}", key)));
        }
        Ok(self.root.join(bucket).join(Path::new(key)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), CrawlError> {
        let path = self.path_for(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, CrawlError> {
        let path = self.path_for(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CrawlError::Storage(e.to_string())),
        }
    }
}
