//! The container backend contract.
//!
//! The agent drives its isolation provider through this narrow interface:
//! create a container, run processes inside it, move files in and out, and
//! destroy it. Everything above this trait is backend-agnostic; the in-tree
//! [`LocalBackend`](crate::backend_local::LocalBackend) materializes
//! containers as host sandbox directories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::api::PortMapping;

/// Backend identifier for one created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the backend needs to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub guid: String,
    pub root_fs: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_weight: u32,
    pub ports: Vec<PortMapping>,
}

/// One process to run inside a container.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub nofile: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("failed to create container: {0}")]
    Create(String),
    #[error("failed to run process: {0}")]
    Run(String),
    #[error("copy into container failed: {0}")]
    CopyIn(String),
    #[error("copy out of container failed: {0}")]
    CopyOut(String),
    #[error("failed to destroy container: {0}")]
    Destroy(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A process started inside a container.
///
/// Output pipes are taken once by the caller; `wait` and `kill` remain
/// available afterwards. All operations are cancel-safe: dropping the handle
/// must not leak the underlying process.
#[async_trait]
pub trait SpawnedProcess: Send {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Wait for the process to exit and return its exit status.
    async fn wait(&mut self) -> Result<i32, BackendError>;

    /// Forcibly terminate the process.
    async fn kill(&mut self) -> Result<(), BackendError>;
}

/// The isolation provider consumed by the registry and the leaf steps.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, BackendError>;

    async fn run(
        &self,
        handle: &ContainerHandle,
        spec: ProcessSpec,
    ) -> Result<Box<dyn SpawnedProcess>, BackendError>;

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dst: &str,
    ) -> Result<(), BackendError>;

    async fn copy_out(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>, BackendError>;

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), BackendError>;
}

/// Resolve a container-relative path against a sandbox root, treating
/// absolute paths as rooted at the sandbox.
pub(crate) fn resolve_in_sandbox(root: &Path, path: &str) -> PathBuf {
    let trimmed = path.trim_start_matches('/');
    root.join(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_paths_stay_under_the_root() {
        let root = Path::new("/sandbox/c-1");
        assert_eq!(
            resolve_in_sandbox(root, "/app/result.txt"),
            PathBuf::from("/sandbox/c-1/app/result.txt")
        );
        assert_eq!(
            resolve_in_sandbox(root, "relative/file"),
            PathBuf::from("/sandbox/c-1/relative/file")
        );
    }
}
