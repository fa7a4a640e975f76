use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

mod http;
mod local;

pub use http::HttpFetcher;
pub use local::LocalFetcher;

use crate::config::OriginConfig;

/// Collection holding the bulk SQL dumps.
pub const SQL_COLLECTION: &str = "sql";
/// Collection holding the cover archives.
pub const COVER_COLLECTION: &str = "covers";
/// Collection holding the daily delta archives.
pub const DAILY_COLLECTION: &str = "daily";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Origin unavailable: {0}")]
    Unavailable(String),
    #[error("Artifact not found: {0}")]
    NotFound(String),
    #[error("Invalid artifact name: {0}")]
    InvalidName(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Fetches named artifacts from a distribution origin.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Names of the artifacts available in `collection`.
    async fn list(&self, collection: &str) -> Result<Vec<String>, FetchError>;

    /// Download `name` from `collection` into `dest_dir`, returning the size.
    ///
    /// The file appears under its final name only once complete.
    async fn fetch(&self, collection: &str, name: &str, dest_dir: &Path) -> Result<u64, FetchError>;
}

/// Reject names that would escape the destination directory.
fn check_name(name: &str) -> Result<(), FetchError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(FetchError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Write `path` atomically by persisting a temporary file from `dest_dir`.
fn persist(tmp: tempfile::NamedTempFile, dest_dir: &Path, name: &str) -> Result<PathBuf, FetchError> {
    let target = dest_dir.join(name);
    tmp.persist(&target).map_err(|e| FetchError::Io(e.error))?;
    Ok(target)
}

/// Build the fetcher for an origin: the local mirror if configured, HTTP otherwise.
pub fn from_config(origin: &OriginConfig) -> Result<Arc<dyn ArtifactFetcher>, FetchError> {
    match &origin.mirror_dir {
        Some(dir) => Ok(Arc::new(LocalFetcher::new(dir))),
        None => Ok(Arc::new(HttpFetcher::new(&origin.base_url, origin.timeout())?)),
    }
}
