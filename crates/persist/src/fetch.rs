//! Remote retrieval of repository indexes and chart or values archives.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use reqwest::Client;
use tracing::info;

#[async_trait::async_trait]
pub trait IndexFetcher: Send + Sync {
    /// Raw `index.yaml` of the repository at `repo_url`.
    async fn index(&self, repo_url: &str) -> Result<Vec<u8>>;
}

#[async_trait::async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().context("building http client")?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("unsupported url scheme: {}", url));
        }
        let response = self.client.get(url).send().await.with_context(|| format!("GET {}", url))?;
        if !response.status().is_success() {
            counter!("charter_http_errors_total", 1u64);
            return Err(anyhow!("GET {} failed: {}", url, response.status()));
        }
        let body = response.bytes().await.with_context(|| format!("reading body of {}", url))?;
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl IndexFetcher for HttpFetcher {
    async fn index(&self, repo_url: &str) -> Result<Vec<u8>> {
        self.get(&format!("{}/index.yaml", repo_url.trim_end_matches('/'))).await
    }
}

#[async_trait::async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let body = self.get(url).await?;
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
        }
        tokio::fs::write(dest, &body).await.with_context(|| format!("writing {}", dest.display()))?;
        info!(url = %url, dest = %dest.display(), bytes = body.len(), "downloaded");
        Ok(())
    }
}
