//! Readiness-then-liveness supervision.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::log_streamer::LogStreamer;

use super::{launch, ReadySignal, Step, StepError, StepResult};

/// Two-phase supervised probe.
///
/// The readiness check must succeed within `start_timeout`; only then does
/// the step raise ready and hand over to the liveness check, which runs
/// without an upper bound until it returns. The readiness and liveness
/// children are full steps, so the composite works across probe mechanisms.
pub struct HealthCheckStep {
    readiness: Box<dyn Step>,
    liveness: Box<dyn Step>,
    start_timeout: Duration,
    streamer: Arc<dyn LogStreamer>,
}

impl HealthCheckStep {
    pub fn new(
        readiness: Box<dyn Step>,
        liveness: Box<dyn Step>,
        start_timeout: Duration,
        streamer: Arc<dyn LogStreamer>,
    ) -> Self {
        Self {
            readiness,
            liveness,
            start_timeout,
            streamer,
        }
    }
}

#[async_trait]
impl Step for HealthCheckStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        self.streamer
            .stdout("Starting health monitoring of container");

        let mut readiness = launch(self.readiness);
        let deadline = tokio::time::sleep(self.start_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            result = readiness.join() => {
                if let Err(err) = result {
                    self.streamer.stderr(&err.to_string());
                    self.streamer.stderr(&format!(
                        "Timed out after {:?}: health check never passed.",
                        self.start_timeout
                    ));
                    info!(error = %err, "timed out before healthy");
                    let message = format!(
                        "Instance never healthy after {:?}: {err}",
                        self.start_timeout
                    );
                    return Err(StepError::emittable(message, err));
                }
            }
            _ = &mut deadline => {
                readiness.cancel();
                let _ = readiness.join().await;
                self.streamer.stderr(&format!(
                    "Timed out after {:?}: health check never passed.",
                    self.start_timeout
                ));
                info!(timeout = ?self.start_timeout, "timed out before healthy");
                let cause = StepError::Timeout(self.start_timeout);
                let message = format!(
                    "Instance never healthy after {:?}: {cause}",
                    self.start_timeout
                );
                return Err(StepError::emittable(message, cause));
            }
            _ = cancel.cancelled() => {
                readiness.cancel();
                let _ = readiness.join().await;
                return Err(StepError::Cancelled);
            }
        }

        info!("transitioned to healthy");
        self.streamer.stdout("Container became healthy");
        ready.signal();

        let mut liveness = launch(self.liveness);
        tokio::select! {
            result = liveness.join() => {
                info!("transitioned to unhealthy");
                let (cause, source) = match result {
                    Err(err) => (err.to_string(), Some(err)),
                    // A liveness probe that exits cleanly has still stopped
                    // vouching for the container.
                    Ok(()) => ("liveness check exited".to_string(), None),
                };
                self.streamer.stderr(&cause);
                self.streamer.stdout("Container became unhealthy");
                Err(StepError::Emittable {
                    message: format!("Instance became unhealthy: {cause}"),
                    source: source.map(Box::new),
                })
            }
            _ = cancel.cancelled() => {
                liveness.cancel();
                let _ = liveness.join().await;
                Err(StepError::Cancelled)
            }
        }
    }
}
