//! Host-process container backend.
//!
//! Materializes each container as a sandbox directory under a configured
//! root and runs processes with the sandbox as their working directory.
//! Memory, disk, and cpu-weight claims are recorded by the registry but not
//! enforced here; this backend exists for single-node deployments and for
//! exercising the agent end to end.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{
    resolve_in_sandbox, BackendError, ContainerBackend, ContainerHandle, ContainerSpec,
    ProcessSpec, SpawnedProcess,
};

pub struct LocalBackend {
    root: PathBuf,
    sandboxes: Mutex<HashMap<String, PathBuf>>,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn sandbox(&self, handle: &ContainerHandle) -> Result<PathBuf, BackendError> {
        self.sandboxes
            .lock()
            .expect("sandbox map poisoned")
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BackendError::ContainerNotFound(handle.0.clone()))
    }
}

#[async_trait]
impl ContainerBackend for LocalBackend {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, BackendError> {
        let id = format!("{}-{}", spec.guid, Uuid::new_v4().simple());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| BackendError::Create(format!("{}: {err}", dir.display())))?;

        debug!(handle = %id, dir = %dir.display(), "created sandbox");
        self.sandboxes
            .lock()
            .expect("sandbox map poisoned")
            .insert(id.clone(), dir);
        Ok(ContainerHandle(id))
    }

    async fn run(
        &self,
        handle: &ContainerHandle,
        spec: ProcessSpec,
    ) -> Result<Box<dyn SpawnedProcess>, BackendError> {
        let dir = self.sandbox(handle)?;

        let mut command = Command::new(&spec.path);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(name, value)| (name, value)))
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|err| BackendError::Run(format!("{}: {err}", spec.path)))?;

        debug!(handle = %handle, path = %spec.path, pid = ?child.id(), "spawned process");
        Ok(Box::new(LocalProcess { child }))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        src: &Path,
        dst: &str,
    ) -> Result<(), BackendError> {
        let dir = self.sandbox(handle)?;
        let target = resolve_in_sandbox(&dir, dst);

        let metadata = tokio::fs::metadata(src)
            .await
            .map_err(|err| BackendError::CopyIn(format!("{}: {err}", src.display())))?;

        if metadata.is_dir() {
            copy_dir(src, &target)
                .await
                .map_err(|err| BackendError::CopyIn(format!("{}: {err}", src.display())))?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| BackendError::CopyIn(format!("{}: {err}", parent.display())))?;
            }
            tokio::fs::copy(src, &target)
                .await
                .map_err(|err| BackendError::CopyIn(format!("{}: {err}", src.display())))?;
        }
        Ok(())
    }

    async fn copy_out(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>, BackendError> {
        let dir = self.sandbox(handle)?;
        let source = resolve_in_sandbox(&dir, path);
        tokio::fs::read(&source)
            .await
            .map_err(|err| BackendError::CopyOut(format!("{}: {err}", source.display())))
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), BackendError> {
        let dir = self
            .sandboxes
            .lock()
            .expect("sandbox map poisoned")
            .remove(&handle.0)
            .ok_or_else(|| BackendError::ContainerNotFound(handle.0.clone()))?;

        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(handle = %handle, error = %err, "failed to remove sandbox");
                return Err(BackendError::Destroy(format!("{}: {err}", dir.display())));
            }
        }
        debug!(handle = %handle, "destroyed sandbox");
        Ok(())
    }
}

struct LocalProcess {
    child: Child,
}

#[async_trait]
impl SpawnedProcess for LocalProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn wait(&mut self) -> Result<i32, BackendError> {
        let status = self.child.wait().await?;
        // Signal-terminated processes report no code; fold them to -1.
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), BackendError> {
        // A process that already exited is fine to "kill" again.
        let _ = self.child.start_kill();
        Ok(())
    }
}

fn copy_dir<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}
