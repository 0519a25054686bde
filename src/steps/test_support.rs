//! Scriptable steps for exercising composite semantics.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{ReadySignal, Step, StepError, StepResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(&'static str),
    Ready(&'static str),
    Finished(&'static str),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<Event> {
    log.lock().expect("event log poisoned").clone()
}

/// A step whose readiness, outcome, and lifetime are scripted by the test.
pub struct StubStep {
    name: &'static str,
    raise_ready: bool,
    outcome: Option<StepResult>,
    until_cancelled: bool,
    trigger: Option<oneshot::Receiver<StepResult>>,
    log: Option<EventLog>,
}

impl StubStep {
    pub fn succeeding() -> Self {
        Self::with_outcome(Ok(()))
    }

    pub fn failing(err: StepError) -> Self {
        Self::with_outcome(Err(err))
    }

    fn with_outcome(outcome: StepResult) -> Self {
        Self {
            name: "stub",
            raise_ready: true,
            outcome: Some(outcome),
            until_cancelled: false,
            trigger: None,
            log: None,
        }
    }

    /// Raises ready, then blocks until cancelled.
    pub fn until_cancelled() -> Self {
        Self {
            until_cancelled: true,
            ..Self::succeeding()
        }
    }

    /// Blocks until the returned sender supplies the outcome (or is dropped,
    /// which reads as success).
    pub fn triggered() -> (Self, oneshot::Sender<StepResult>) {
        let (tx, rx) = oneshot::channel();
        let step = Self {
            trigger: Some(rx),
            ..Self::succeeding()
        };
        (step, tx)
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn without_ready(mut self) -> Self {
        self.raise_ready = false;
        self
    }

    pub fn logging_to(mut self, log: &EventLog) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    fn record(&self, event: Event) {
        if let Some(log) = &self.log {
            log.lock().expect("event log poisoned").push(event);
        }
    }
}

#[async_trait]
impl Step for StubStep {
    async fn run(
        mut self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        self.record(Event::Started(self.name));
        if self.raise_ready {
            ready.signal();
            self.record(Event::Ready(self.name));
        }

        let result = if let Some(trigger) = self.trigger.take() {
            tokio::select! {
                outcome = trigger => outcome.unwrap_or(Ok(())),
                _ = cancel.cancelled() => Err(StepError::Cancelled),
            }
        } else if self.until_cancelled {
            cancel.cancelled().await;
            Err(StepError::Cancelled)
        } else {
            self.outcome.take().expect("stub outcome already taken")
        };

        self.record(Event::Finished(self.name));
        result
    }
}
