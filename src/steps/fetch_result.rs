//! Result extraction from the container.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::FetchResultActionModel;
use crate::backend::{ContainerBackend, ContainerHandle};

use super::{ReadySignal, Step, StepError, StepResult};

/// Upper bound on a result file. Anything larger fails the step.
pub const MAX_RESULT_BYTES: usize = 10 * 1024;

/// Cell the caller supplies to receive the trimmed result contents.
pub type SharedResult = Arc<Mutex<String>>;

pub struct FetchResultStep {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    model: FetchResultActionModel,
    result: SharedResult,
}

impl FetchResultStep {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        handle: ContainerHandle,
        model: FetchResultActionModel,
        result: SharedResult,
    ) -> Self {
        Self {
            backend,
            handle,
            model,
            result,
        }
    }
}

#[async_trait]
impl Step for FetchResultStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        ready.signal();

        let bytes = tokio::select! {
            copied = self.backend.copy_out(&self.handle, &self.model.file) => copied?,
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
        };

        if bytes.len() > MAX_RESULT_BYTES {
            return Err(StepError::ResultTooLarge {
                size: bytes.len(),
                limit: MAX_RESULT_BYTES,
            });
        }

        let contents = String::from_utf8_lossy(&bytes).trim().to_string();
        *self.result.lock().expect("result cell poisoned") = contents;
        Ok(())
    }
}
