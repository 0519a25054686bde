//! Compress-and-upload out of the container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::UploadActionModel;
use crate::backend::{ContainerBackend, ContainerHandle};
use crate::log_streamer::LogStreamer;
use crate::uploader::Uploader;

use super::{ReadySignal, Step, StepError, StepResult};

/// Copies a path out of the container, wraps it in a gzipped tarball, and
/// uploads the result. Progress goes through the log sink; the staging
/// directory is removed on every exit path.
pub struct UploadStep {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    model: UploadActionModel,
    uploader: Arc<dyn Uploader>,
    streamer: Arc<dyn LogStreamer>,
    temp_dir: PathBuf,
}

impl UploadStep {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        handle: ContainerHandle,
        model: UploadActionModel,
        uploader: Arc<dyn Uploader>,
        streamer: Arc<dyn LogStreamer>,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            handle,
            model,
            uploader,
            streamer,
            temp_dir,
        }
    }
}

#[async_trait]
impl Step for UploadStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        ready.signal();

        let url = Url::parse(&self.model.to)
            .map_err(|err| StepError::Upload(format!("{}: {err}", self.model.to)))?;

        self.streamer
            .stdout(&format!("Uploading {}", self.model.from));

        let contents = tokio::select! {
            copied = self.backend.copy_out(&self.handle, &self.model.from) => copied?,
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
        };

        let staging = tempfile::Builder::new()
            .prefix("upload")
            .tempdir_in(&self.temp_dir)?;
        let archive = staging.path().join("upload.tgz");

        let entry_name = Path::new(&self.model.from)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let archive_path = archive.clone();
        let compressed =
            tokio::task::spawn_blocking(move || compress(&archive_path, &entry_name, &contents))
                .await
                .map_err(|err| StepError::Upload(err.to_string()))?;
        compressed
            .map_err(|err| StepError::Upload(format!("compressing {}: {err}", self.model.from)))?;

        tokio::select! {
            uploaded = self.uploader.upload(&archive, &url) => {
                uploaded.map_err(|err| StepError::Upload(err.to_string()))?
            }
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
        }

        let size = tokio::fs::metadata(&archive).await.map(|m| m.len()).unwrap_or(0);
        self.streamer
            .stdout(&format!("Uploaded {} ({size} bytes)", self.model.from));
        Ok(())
    }
}

fn compress(archive: &Path, entry_name: &str, contents: &[u8]) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, entry_name, contents)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_local::LocalBackend;
    use crate::log_streamer::InMemoryLogStreamer;
    use crate::steps::launch;
    use crate::uploader::UploadError;
    use std::sync::Mutex;

    /// Captures uploaded archives instead of shipping them anywhere.
    #[derive(Default)]
    struct CapturingUploader {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Uploader for CapturingUploader {
        async fn upload(&self, src: &Path, url: &Url) -> Result<(), UploadError> {
            let bytes = std::fs::read(src)?;
            self.uploads
                .lock()
                .expect("uploads poisoned")
                .push((url.to_string(), bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn uploads_a_tarball_of_the_container_file() {
        let sandbox_root = tempfile::tempdir().expect("tempdir");
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(LocalBackend::new(sandbox_root.path().to_path_buf()));
        let handle = backend
            .create(crate::backend::ContainerSpec {
                guid: "upload-test".to_string(),
                root_fs: String::new(),
                memory_mb: 64,
                disk_mb: 64,
                cpu_weight: 0,
                ports: vec![],
            })
            .await
            .expect("create container");

        let src = tempfile::tempdir().expect("tempdir");
        let payload = src.path().join("report.txt");
        std::fs::write(&payload, b"report-body").expect("write payload");
        backend
            .copy_in(&handle, &payload, "/out/report.txt")
            .await
            .expect("seed container file");

        let uploader = Arc::new(CapturingUploader::default());
        let streamer = InMemoryLogStreamer::new();
        let step = Box::new(UploadStep::new(
            Arc::clone(&backend) as Arc<dyn ContainerBackend>,
            handle,
            UploadActionModel {
                from: "/out/report.txt".to_string(),
                to: "http://drop.test/report".to_string(),
            },
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            Arc::clone(&streamer) as Arc<dyn LogStreamer>,
            temp.path().to_path_buf(),
        ));

        launch(step).wait().await.expect("upload should succeed");

        let uploads = uploader.uploads.lock().expect("uploads poisoned");
        assert_eq!(uploads.len(), 1);
        let (url, archive) = &uploads[0];
        assert_eq!(url, "http://drop.test/report");

        // The archive holds exactly the container file.
        let decoder = flate2::read::GzDecoder::new(archive.as_slice());
        let mut unpacker = tar::Archive::new(decoder);
        let mut entries = unpacker.entries().expect("tar entries");
        let mut entry = entries
            .next()
            .expect("one entry")
            .expect("entry readable");
        assert_eq!(
            entry.path().expect("entry path").to_string_lossy(),
            "report.txt"
        );
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).expect("read entry");
        assert_eq!(contents, b"report-body");

        let progress = streamer.stdout_lines();
        assert!(progress[0].starts_with("Uploading /out/report.txt"));
        assert!(progress[1].starts_with("Uploaded /out/report.txt"));

        drop(uploads);
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read temp dir")
            .collect();
        assert!(leftovers.is_empty(), "staging should be cleaned up");
    }

    #[tokio::test]
    async fn missing_container_file_fails_the_step() {
        let sandbox_root = tempfile::tempdir().expect("tempdir");
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(LocalBackend::new(sandbox_root.path().to_path_buf()));
        let handle = backend
            .create(crate::backend::ContainerSpec {
                guid: "upload-missing".to_string(),
                root_fs: String::new(),
                memory_mb: 64,
                disk_mb: 64,
                cpu_weight: 0,
                ports: vec![],
            })
            .await
            .expect("create container");

        let step = Box::new(UploadStep::new(
            Arc::clone(&backend) as Arc<dyn ContainerBackend>,
            handle,
            UploadActionModel {
                from: "/no/such/file".to_string(),
                to: "http://drop.test/report".to_string(),
            },
            Arc::new(CapturingUploader::default()),
            InMemoryLogStreamer::new(),
            temp.path().to_path_buf(),
        ));

        let result = launch(step).wait().await;
        assert!(matches!(result, Err(StepError::Backend(_))));
    }
}
