//! Mutually dependent child execution.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{
    aggregate, fan_in_readiness, forward_cancellation, launch, ReadySignal, Step, StepError,
    StepProcess, StepResult,
};

/// Parallel execution with exit coupling: the children are expected to live
/// and die together.
///
/// With `error_on_exit`, a child returning success is itself an error. With
/// `cancel_others_on_exit`, the first child to return success cancels the
/// remainder. Any non-cancelled child error cancels the remainder; the
/// fan-out happens at most once.
pub struct CodependentStep {
    children: Vec<Box<dyn Step>>,
    error_on_exit: bool,
    cancel_others_on_exit: bool,
}

impl CodependentStep {
    pub fn new(
        children: Vec<Box<dyn Step>>,
        error_on_exit: bool,
        cancel_others_on_exit: bool,
    ) -> Self {
        Self {
            children,
            error_on_exit,
            cancel_others_on_exit,
        }
    }
}

#[async_trait]
impl Step for CodependentStep {
    async fn run(self: Box<Self>, cancel: CancellationToken, ready: ReadySignal) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let mut processes: Vec<StepProcess> = self.children.into_iter().map(launch).collect();
        let tokens: Vec<CancellationToken> = processes
            .iter()
            .map(StepProcess::cancellation_token)
            .collect();
        let readies = processes
            .iter_mut()
            .map(StepProcess::take_ready)
            .collect::<Vec<_>>();

        let ready_task = fan_in_readiness(readies, ready);
        let forwarder = forward_cancellation(&cancel, tokens.clone());

        let mut waits: FuturesUnordered<_> =
            processes.into_iter().map(StepProcess::wait).collect();
        let mut errors = Vec::new();
        let mut fanned_out = false;
        let fan_out = |tokens: &[CancellationToken], fanned_out: &mut bool| {
            if !*fanned_out {
                *fanned_out = true;
                for token in tokens {
                    token.cancel();
                }
            }
        };

        while let Some(mut result) = waits.next().await {
            if self.error_on_exit && result.is_ok() {
                result = Err(StepError::CodependentExited);
            }

            match result {
                Ok(()) => {
                    if self.cancel_others_on_exit {
                        fan_out(&tokens, &mut fanned_out);
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    errors.push(err);
                    fan_out(&tokens, &mut fanned_out);
                }
            }
        }

        forwarder.abort();
        let _ = ready_task.await;

        if errors.is_empty() && cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        aggregate(errors)
    }
}
