use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::artifacts::{check_name, persist, ArtifactFetcher, FetchError};

const USER_AGENT: &str = concat!("catalog-sync/", env!("CARGO_PKG_VERSION"));

/// Fetches artifacts from an HTTP origin serving plain directory indexes.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| FetchError::Unavailable(format!("invalid origin URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, base_url })
    }

    fn collection_url(&self, collection: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(&format!("{}/", collection))
            .map_err(|e| FetchError::Unavailable(e.to_string()))
    }
}

/// Extract plain file names from the `href` targets of a directory index.
///
/// Subdirectories, parent links, query links and absolute URLs are ignored.
pub(crate) fn parse_index(body: &str) -> Vec<String> {
    let mut names: Vec<String> = lazy_regex::regex!(r#"(?i)href\s*=\s*"([^"]+)""#)
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|href| {
            !href.contains('/')
                && !href.contains(':')
                && !href.starts_with('?')
                && !href.starts_with('#')
                && !href.starts_with('.')
        })
        .map(|href| href.to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn list(&self, collection: &str) -> Result<Vec<String>, FetchError> {
        let url = self.collection_url(collection)?;
        debug!("Listing {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let body = response.text().await?;
        Ok(parse_index(&body))
    }

    async fn fetch(&self, collection: &str, name: &str, dest_dir: &Path) -> Result<u64, FetchError> {
        check_name(name)?;
        let url = self
            .collection_url(collection)?
            .join(name)
            .map_err(|_| FetchError::InvalidName(name.to_string()))?;
        debug!("Downloading {}", url);

        let mut response = self.client.get(url.clone()).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(url.to_string())),
            status if !status.is_success() => {
                return Err(FetchError::Unavailable(format!("{}: HTTP {}", url, status)))
            }
            _ => {}
        }

        let tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
        let mut file = tokio::fs::File::from_std(tmp.as_file().try_clone()?);
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        persist(tmp, dest_dir, name)?;
        Ok(size)
    }
}
