//! Process execution inside the backend container.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::RunActionModel;
use crate::backend::{BackendError, ContainerBackend, ContainerHandle, ProcessSpec};
use crate::log_streamer::{LogStreamer, StreamKind};

use super::{ReadySignal, Step, StepError, StepResult};

/// Runs a single process with the action's argv, env, resource limits, and
/// timeout, streaming its output through the log sink.
pub struct RunStep {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    model: RunActionModel,
    env: Vec<(String, String)>,
    streamer: Arc<dyn LogStreamer>,
}

impl RunStep {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        handle: ContainerHandle,
        model: RunActionModel,
        env: Vec<(String, String)>,
        streamer: Arc<dyn LogStreamer>,
    ) -> Self {
        Self {
            backend,
            handle,
            model,
            env,
            streamer,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.model
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

enum WaitOutcome {
    Exited(Result<i32, BackendError>),
    TimedOut(Duration),
    Cancelled,
}

#[async_trait]
impl Step for RunStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let spec = ProcessSpec {
            path: self.model.path.clone(),
            args: self.model.args.clone(),
            env: self.env.clone(),
            nofile: self.model.resource_limits.and_then(|limits| limits.nofile),
        };

        debug!(handle = %self.handle, path = %spec.path, "starting process");
        let mut process = self.backend.run(&self.handle, spec).await?;

        let stdout_pump = process
            .take_stdout()
            .map(|reader| pump(reader, Arc::clone(&self.streamer), StreamKind::Stdout));
        let stderr_pump = process
            .take_stderr()
            .map(|reader| pump(reader, Arc::clone(&self.streamer), StreamKind::Stderr));

        // The process is started; readiness means started for run steps.
        ready.signal();

        if cancel.is_cancelled() {
            process.kill().await.ok();
            let _ = process.wait().await;
            drain(stdout_pump, stderr_pump).await;
            return Err(StepError::Cancelled);
        }

        let timeout = self.timeout();
        let outcome = {
            let wait = process.wait();
            tokio::pin!(wait);
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            tokio::select! {
                status = &mut wait => WaitOutcome::Exited(status),
                _ = cancel.cancelled() => WaitOutcome::Cancelled,
                _ = &mut deadline => WaitOutcome::TimedOut(timeout.unwrap_or_default()),
            }
        };

        match outcome {
            WaitOutcome::Exited(status) => {
                drain(stdout_pump, stderr_pump).await;
                match status? {
                    0 => Ok(()),
                    code => Err(StepError::ExitStatus(code)),
                }
            }
            WaitOutcome::Cancelled => {
                process.kill().await.ok();
                let _ = process.wait().await;
                drain(stdout_pump, stderr_pump).await;
                Err(StepError::Cancelled)
            }
            WaitOutcome::TimedOut(limit) => {
                process.kill().await.ok();
                let _ = process.wait().await;
                drain(stdout_pump, stderr_pump).await;
                Err(StepError::Timeout(limit))
            }
        }
    }
}

fn pump(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    streamer: Arc<dyn LogStreamer>,
    kind: StreamKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match kind {
                StreamKind::Stdout => streamer.stdout(&line),
                StreamKind::Stderr => streamer.stderr(&line),
            }
        }
    })
}

async fn drain(stdout: Option<JoinHandle<()>>, stderr: Option<JoinHandle<()>>) {
    if let Some(handle) = stdout {
        let _ = handle.await;
    }
    if let Some(handle) = stderr {
        let _ = handle.await;
    }
}
