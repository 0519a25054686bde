//! The step model: supervised activities compiled from action trees.
//!
//! Every step, leaf or composite, exposes one operation:
//!
//! ```text
//! run(cancel, ready) -> Result<(), StepError>
//! ```
//!
//! - `cancel` is a [`CancellationToken`]; receipt obliges the step to begin
//!   orderly termination and eventually return [`StepError::Cancelled`].
//! - `ready` is a one-shot signal the step raises at most once, when it is
//!   serving (for most steps: started; for health checks: healthy).
//! - `run` returns only after everything the step owns has been released and
//!   every child supervisor it started has itself returned.
//!
//! [`launch`] places a step under supervision as its own task and hands back
//! a [`StepProcess`] for cancellation, readiness observation, and waiting.
//! Composite steps own the cancellation fan-out to their children; leaves
//! never fan out.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendError;

mod codependent;
mod download;
mod emit_progress;
mod fetch_result;
mod health_check;
mod monitor;
mod parallel;
mod run;
mod serial;
mod try_step;
mod upload;

pub use codependent::CodependentStep;
pub use download::DownloadStep;
pub use emit_progress::EmitProgressStep;
pub use fetch_result::{FetchResultStep, SharedResult, MAX_RESULT_BYTES};
pub use health_check::HealthCheckStep;
pub use monitor::{CheckFactory, HookRequest, MonitorStep};
pub use parallel::ParallelStep;
pub use run::RunStep;
pub use serial::SerialStep;
pub use try_step::TryStep;
pub use upload::UploadStep;

#[cfg(test)]
pub(crate) mod test_support;

pub type StepResult = Result<(), StepError>;

/// A supervised activity. Leaves do the work; composites coordinate children.
#[async_trait]
pub trait Step: Send + 'static {
    async fn run(self: Box<Self>, cancel: CancellationToken, ready: ReadySignal) -> StepResult;
}

/// One-shot readiness signal. Raising it twice is a no-op; a step that never
/// becomes ready simply drops it.
pub struct ReadySignal {
    tx: Option<oneshot::Sender<()>>,
}

impl ReadySignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Raise readiness. Idempotent.
    pub fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Handle to a step running under supervision.
pub struct StepProcess {
    token: CancellationToken,
    ready: Option<oneshot::Receiver<()>>,
    handle: JoinHandle<StepResult>,
}

/// Start a step as its own supervised task.
pub fn launch(step: Box<dyn Step>) -> StepProcess {
    let token = CancellationToken::new();
    let (ready, ready_rx) = ReadySignal::new();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { step.run(run_token, ready).await });
    StepProcess {
        token,
        ready: Some(ready_rx),
        handle,
    }
}

impl StepProcess {
    /// Deliver the interrupt. Idempotent; a second cancel is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The token cancelling this step; composites collect these for fan-out.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Take the readiness receiver. Resolves `Ok(())` when the step raises
    /// ready, `Err` when it terminates without ever becoming ready.
    pub fn take_ready(&mut self) -> oneshot::Receiver<()> {
        self.ready.take().expect("readiness receiver already taken")
    }

    /// Wait for the step to terminate without consuming the handle.
    pub async fn join(&mut self) -> StepResult {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(StepError::Cancelled),
        }
    }

    /// Wait for the step to terminate.
    pub async fn wait(mut self) -> StepResult {
        self.join().await
    }
}

/// Behavioral error kinds for steps. [`StepError::Cancelled`] is a sentinel,
/// not a failure: composites filter it from aggregates and the registry never
/// surfaces it as a container failure.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    /// Carries a user-facing message, logged to the container's stderr stream
    /// and embedded in the run result's failure reason.
    #[error("{message}")]
    Emittable {
        message: String,
        #[source]
        source: Option<Box<StepError>>,
    },

    #[error("process exited with status {0}")]
    ExitStatus(i32),

    #[error("process did not exit within {0:?}")]
    Timeout(Duration),

    #[error("codependent step exited")]
    CodependentExited,

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<StepError>),

    #[error("result file too large: {size} bytes (limit {limit})")]
    ResultTooLarge { size: usize, limit: usize },

    #[error("download failed: {0}")]
    Download(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }

    pub fn emittable(message: impl Into<String>, source: StepError) -> Self {
        StepError::Emittable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

fn join_errors(errors: &[StepError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapse gathered child errors: empty means success, otherwise a
/// multi-error. Callers have already filtered the cancelled sentinel.
pub(crate) fn aggregate(errors: Vec<StepError>) -> StepResult {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StepError::Aggregate(errors))
    }
}

/// Forward one cancellation to every child token, exactly once.
///
/// The returned task must be aborted (or have fired) before the composite
/// returns; children treat a second cancel as a no-op either way.
pub(crate) fn forward_cancellation(
    cancel: &CancellationToken,
    children: Vec<CancellationToken>,
) -> JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        for child in children {
            child.cancel();
        }
    })
}

/// Raise the outer ready once every child has raised its own. Children that
/// terminate without ever becoming ready leave the outer ready unraised. The
/// task always terminates once all children have terminated.
pub(crate) fn fan_in_readiness(
    receivers: Vec<oneshot::Receiver<()>>,
    mut ready: ReadySignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for rx in receivers {
            if rx.await.is_err() {
                return;
            }
        }
        ready.signal();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_signal_is_one_shot() {
        let (mut ready, rx) = ReadySignal::new();
        ready.signal();
        ready.signal();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_ready_signal_reports_never_ready() {
        let (ready, rx) = ReadySignal::new();
        drop(ready);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn launch_runs_the_step_to_completion() {
        let step = test_support::StubStep::succeeding();
        let process = launch(Box::new(step));
        assert!(process.wait().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let step = test_support::StubStep::until_cancelled();
        let process = launch(Box::new(step));
        process.cancel();
        process.cancel();
        let result = process.wait().await;
        assert!(matches!(result, Err(StepError::Cancelled)));
    }

    #[test]
    fn aggregate_joins_with_semicolons() {
        let err = StepError::Aggregate(vec![
            StepError::ExitStatus(1),
            StepError::CodependentExited,
        ]);
        assert_eq!(
            err.to_string(),
            "process exited with status 1; codependent step exited"
        );
    }

    #[test]
    fn empty_aggregate_collapses_to_success() {
        assert!(aggregate(vec![]).is_ok());
        assert!(aggregate(vec![StepError::ExitStatus(2)]).is_err());
    }
}
