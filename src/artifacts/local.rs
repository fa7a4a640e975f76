use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::artifacts::{check_name, persist, ArtifactFetcher, FetchError};

/// Serves artifacts from a mirror directory laid out as `<root>/<collection>/<name>`.
#[derive(Debug)]
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for LocalFetcher {
    async fn list(&self, collection: &str) -> Result<Vec<String>, FetchError> {
        let dir = self.root.join(collection);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            FetchError::Unavailable(format!("{}: {}", dir.display(), e))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, collection: &str, name: &str, dest_dir: &Path) -> Result<u64, FetchError> {
        check_name(name)?;
        let source = self.root.join(collection).join(name);
        if !source.is_file() {
            return Err(FetchError::NotFound(format!("{}/{}", collection, name)));
        }

        let tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
        let size = tokio::fs::copy(&source, tmp.path()).await?;
        persist(tmp, dest_dir, name)?;
        Ok(size)
    }
}
