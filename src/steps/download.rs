//! Cached download into the container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::api::DownloadActionModel;
use crate::backend::{ContainerBackend, ContainerHandle};
use crate::downloader::Downloader;
use crate::log_streamer::LogStreamer;

use super::{ReadySignal, Step, StepError, StepResult};

/// Fetches a URL through the cached downloader and places it (optionally
/// extracted) at a path inside the container. Temporary artifacts are
/// removed on every exit path.
pub struct DownloadStep {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    model: DownloadActionModel,
    downloader: Arc<dyn Downloader>,
    streamer: Arc<dyn LogStreamer>,
    temp_dir: PathBuf,
}

impl DownloadStep {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        handle: ContainerHandle,
        model: DownloadActionModel,
        downloader: Arc<dyn Downloader>,
        streamer: Arc<dyn LogStreamer>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            handle,
            model,
            downloader,
            streamer,
            temp_dir,
        }
    }
}

#[async_trait]
impl Step for DownloadStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        ready.signal();

        let url = Url::parse(&self.model.from)
            .map_err(|err| StepError::Download(format!("{}: {err}", self.model.from)))?;

        self.streamer
            .stdout(&format!("Downloading {}", self.model.from));

        let artifact = tokio::select! {
            fetched = self.downloader.fetch(&url, self.model.cache_key.as_deref()) => {
                fetched.map_err(|err| StepError::Download(err.to_string()))?
            }
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
        };

        // Holds extraction output; dropped (and removed) on every exit path.
        let staging = tempfile::Builder::new()
            .prefix("download")
            .tempdir_in(&self.temp_dir)?;

        let source: PathBuf = if self.model.extract {
            let archive = artifact.clone();
            let dest = staging.path().join("extracted");
            let unpack_dest = dest.clone();
            let unpacked =
                tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &unpack_dest))
                    .await
                    .map_err(|err| StepError::Download(err.to_string()))?;
            unpacked.map_err(|err| {
                StepError::Download(format!("extracting {}: {err}", self.model.from))
            })?;
            dest
        } else {
            artifact
        };

        debug!(handle = %self.handle, to = %self.model.to, "placing download");
        tokio::select! {
            copied = self.backend.copy_in(&self.handle, &source, &self.model.to) => copied?,
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
        }

        self.streamer
            .stdout(&format!("Downloaded {}", self.model.from));
        Ok(())
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut unpacker = tar::Archive::new(decoder);
    unpacker.unpack(dest)
}
