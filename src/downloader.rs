//! Service and layer archive download.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Fetches an artifact URL into a local file. Mockable for tests.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, dst: &Path) -> Result<()>;
}

/// HTTP(S) downloader streaming the response body to disk.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dst: &Path) -> Result<()> {
        info!(url, dst = %dst.display(), "downloading artifact");

        // file:// sources are used on closed setups where artifacts are
        // delivered out of band.
        if let Some(path) = url.strip_prefix("file://") {
            tokio::fs::copy(path, dst).await?;

            return Ok(());
        }

        let mut response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "download {url} failed: {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dst).await?;
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;

        debug!(url, written, "download complete");

        Ok(())
    }
}
