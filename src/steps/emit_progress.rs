//! Progress messages around a child step.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::log_streamer::LogStreamer;

use super::{ReadySignal, Step, StepResult};

/// Writes the start message before the child runs, then the success or
/// failure message depending on the child's outcome. Ready, cancellation,
/// and the child's return value pass through untouched. Empty messages are
/// skipped.
pub struct EmitProgressStep {
    child: Box<dyn Step>,
    start_message: String,
    success_message: String,
    failure_message: String,
    streamer: Arc<dyn LogStreamer>,
}

impl EmitProgressStep {
    pub fn new(
        child: Box<dyn Step>,
        start_message: impl Into<String>,
        success_message: impl Into<String>,
        failure_message: impl Into<String>,
        streamer: Arc<dyn LogStreamer>,
    ) -> Self {
        Self {
            child,
            start_message: start_message.into(),
            success_message: success_message.into(),
            failure_message: failure_message.into(),
            streamer,
        }
    }
}

#[async_trait]
impl Step for EmitProgressStep {
    async fn run(self: Box<Self>, cancel: CancellationToken, ready: ReadySignal) -> StepResult {
        if !self.start_message.is_empty() {
            self.streamer.stdout(&self.start_message);
        }

        let result = self.child.run(cancel, ready).await;

        match &result {
            Ok(()) => {
                if !self.success_message.is_empty() {
                    self.streamer.stdout(&self.success_message);
                }
            }
            Err(_) => {
                if !self.failure_message.is_empty() {
                    self.streamer.stderr(&self.failure_message);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_streamer::InMemoryLogStreamer;
    use crate::steps::test_support::{event_log, events, Event, StubStep};
    use crate::steps::{launch, StepError};

    fn wrapped(
        child: StubStep,
        streamer: &Arc<InMemoryLogStreamer>,
    ) -> Box<EmitProgressStep> {
        Box::new(EmitProgressStep::new(
            Box::new(child),
            "starting",
            "succeeded",
            "failed",
            Arc::clone(streamer) as Arc<dyn LogStreamer>,
        ))
    }

    #[tokio::test]
    async fn start_precedes_the_child_and_success_follows() {
        let streamer = InMemoryLogStreamer::new();
        let log = event_log();
        let step = wrapped(StubStep::succeeding().named("child").logging_to(&log), &streamer);

        launch(step).wait().await.expect("child succeeds");

        assert_eq!(streamer.stdout_lines(), vec!["starting", "succeeded"]);
        assert!(streamer.stderr_lines().is_empty());
        assert!(events(&log).contains(&Event::Started("child")));
    }

    #[tokio::test]
    async fn failure_message_goes_to_stderr_and_the_error_passes_through() {
        let streamer = InMemoryLogStreamer::new();
        let step = wrapped(StubStep::failing(StepError::ExitStatus(9)), &streamer);

        let result = launch(step).wait().await;

        assert!(matches!(result, Err(StepError::ExitStatus(9))));
        assert_eq!(streamer.stdout_lines(), vec!["starting"]);
        assert_eq!(streamer.stderr_lines(), vec!["failed"]);
    }

    #[tokio::test]
    async fn empty_messages_are_not_emitted() {
        let streamer = InMemoryLogStreamer::new();
        let step = Box::new(EmitProgressStep::new(
            Box::new(StubStep::succeeding()),
            "",
            "",
            "",
            Arc::clone(&streamer) as Arc<dyn LogStreamer>,
        ));

        launch(step).wait().await.expect("child succeeds");
        assert!(streamer.lines().is_empty());
    }
}
