use super::error::{Result, StoreError};
use super::traits::KeyValueBackend;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;

/// One JSON file per key under a base directory.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn sanitize_filename(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.json", Self::sanitize_filename(key)))
    }
}

#[async_trait]
impl KeyValueBackend for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        // Write then rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
