//! Concurrent child execution.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{
    aggregate, fan_in_readiness, forward_cancellation, launch, ReadySignal, Step, StepError,
    StepProcess, StepResult,
};

/// Starts all children concurrently and waits for every one of them.
/// Readiness is the fan-in of all children's readiness. The first
/// non-cancelled child error cancels the remaining children; cancelled
/// returns are filtered from the aggregate.
pub struct ParallelStep {
    children: Vec<Box<dyn Step>>,
}

impl ParallelStep {
    pub fn new(children: Vec<Box<dyn Step>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Step for ParallelStep {
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

        while let Some(result) = waits.next().await {
            match result {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    errors.push(err);
                    if !fanned_out {
                        fanned_out = true;
                        for token in &tokens {
                            token.cancel();
                        }
                    }
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
