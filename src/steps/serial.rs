//! In-order child execution.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{launch, ReadySignal, Step, StepError, StepResult};

/// Runs children in order, stopping at the first error. Readiness follows
/// the first child; cancellation during child *i* cancels that child and
/// never starts *i+1*.
pub struct SerialStep {
    children: Vec<Box<dyn Step>>,
}

impl SerialStep {
    pub fn new(children: Vec<Box<dyn Step>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Step for SerialStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if self.children.is_empty() {
            ready.signal();
            return Ok(());
        }

        for (index, child) in self.children.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let mut process = launch(child);
            let mut first_ready = (index == 0).then(|| process.take_ready());

            let result = loop {
                tokio::select! {
                    result = process.join() => break result,
                    outcome = async {
                        first_ready.as_mut().expect("guarded by branch condition").await
                    }, if first_ready.is_some() => {
                        if outcome.is_ok() {
                            ready.signal();
                        }
                        first_ready = None;
                    }
                    _ = cancel.cancelled() => {
                        process.cancel();
                        let _ = process.join().await;
                        return Err(StepError::Cancelled);
                    }
                }
            };

            // The child may have raised ready in the same instant it
            // finished; don't lose the edge.
            if let Some(mut rx) = first_ready.take() {
                if rx.try_recv().is_ok() {
                    ready.signal();
                }
            }

            result?;
        }

        Ok(())
    }
}
