//! Failure absorption.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ReadySignal, Step, StepResult};

/// Runs the child and succeeds no matter what the child returned. Absorbed
/// failures are logged; readiness and cancellation pass straight through.
pub struct TryStep {
    child: Box<dyn Step>,
}

impl TryStep {
    pub fn new(child: Box<dyn Step>) -> Self {
        Self { child }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn run(self: Box<Self>, cancel: CancellationToken, ready: ReadySignal) -> StepResult {
        if let Err(err) = self.child.run(cancel, ready).await {
            info!(error = %err, "try step absorbed failure");
        }
        Ok(())
    }
}
