//! Cached asset downloads.
//!
//! The downloader is a capability interface so tests can substitute local
//! fixtures. [`CachedDownloader`] keeps one artifact per cache key on disk
//! and coalesces concurrent fetches of the same key: repeated requests
//! return equivalent artifacts without refetching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded {status} for {url}")]
    Status { url: String, status: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url`, returning the path of the downloaded artifact. The
    /// artifact is owned by the downloader; callers copy, never delete.
    async fn fetch(&self, url: &Url, cache_key: Option<&str>) -> Result<PathBuf, DownloadError>;
}

pub struct CachedDownloader {
    client: reqwest::Client,
    cache_dir: PathBuf,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CachedDownloader {
    pub fn new(client: reqwest::Client, cache_dir: PathBuf) -> Self {
        Self {
            client,
            cache_dir,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn cache_path(&self, url: &Url, cache_key: Option<&str>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(cache_key.unwrap_or(url.as_str()).as_bytes());
        self.cache_dir.join(format!("{:x}", hasher.finalize()))
    }

    async fn key_guard(&self, path: &Path) -> Arc<Mutex<()>> {
        let key = path.to_string_lossy().into_owned();
        let mut inflight = self.inflight.lock().await;
        Arc::clone(inflight.entry(key).or_default())
    }

    async fn download_to(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let tmp = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut body = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl Downloader for CachedDownloader {
    async fn fetch(&self, url: &Url, cache_key: Option<&str>) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let path = self.cache_path(url, cache_key);

        let guard = self.key_guard(&path).await;
        let _held = guard.lock().await;

        if tokio::fs::try_exists(&path).await? {
            debug!(url = %url, path = %path.display(), "download cache hit");
            return Ok(path);
        }

        debug!(url = %url, path = %path.display(), "downloading");
        self.download_to(url, &path).await?;
        Ok(path)
    }
}
