//! Artifact uploads.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded {status} for {url}")]
    Status { url: String, status: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, src: &Path, url: &Url) -> Result<(), UploadError>;
}

/// Streams the file body to the destination with a POST.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, src: &Path, url: &Url) -> Result<(), UploadError> {
        let file = tokio::fs::File::open(src).await?;
        let size = file.metadata().await?.len();
        debug!(url = %url, size, "uploading artifact");

        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UploadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn uploads_the_file_body() {
        use axum::{extract::State, routing::post, Router};

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/drop",
                post(
                    |State(received): State<Arc<Mutex<Vec<u8>>>>, body: axum::body::Bytes| async move {
                        *received.lock().expect("received poisoned") = body.to_vec();
                        axum::http::StatusCode::OK
                    },
                ),
            )
            .with_state(Arc::clone(&received));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("artifact.bin");
        std::fs::write(&src, b"payload").expect("write artifact");

        let uploader = HttpUploader::new(reqwest::Client::new());
        let url = Url::parse(&format!("http://{addr}/drop")).expect("url");
        uploader.upload(&src, &url).await.expect("upload");

        assert_eq!(received.lock().expect("received poisoned").as_slice(), b"payload");
    }
}
