//! Container registry and resource allocator.
//!
//! One logical lock covers the whole state: the record table, the remaining
//! capacity, and the live run handles. The lock is held only for pure state
//! mutation; backend calls, step compilation, and supervisor spawns happen
//! outside it, reacquiring to record outcomes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    AllocationRequest, Container, ContainerRunResult, ContainerState, ExecutorResources,
    InitializeRequest, RunRequest,
};
use crate::backend::{BackendError, ContainerBackend, ContainerHandle, ContainerSpec};
use crate::callback::{post_run_result, CallbackPolicy};
use crate::log_streamer::{LogStreamer, TracingLogStreamer};
use crate::steps::{launch, SerialStep, SharedResult, StepResult};
use crate::transformer::{TransformError, Transformer};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container already allocated: {0}")]
    AlreadyExists(String),
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("container {guid} is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        guid: String,
        expected: ContainerState,
        actual: ContainerState,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Handle on a container's live step tree.
#[derive(Clone)]
struct ActiveRun {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

struct State {
    containers: HashMap<String, Container>,
    remaining: ExecutorResources,
    runs: HashMap<String, ActiveRun>,
}

/// Process-wide container bookkeeping: admission against the declared
/// capacity, the reserved → initializing → created → completed state
/// machine, and the binding of each created container to its supervised
/// step tree.
pub struct Registry {
    capacity: ExecutorResources,
    state: Mutex<State>,
    backend: Arc<dyn ContainerBackend>,
    transformer: Transformer,
    client: reqwest::Client,
    callback_policy: CallbackPolicy,
}

impl Registry {
    pub fn new(
        capacity: ExecutorResources,
        backend: Arc<dyn ContainerBackend>,
        transformer: Transformer,
        client: reqwest::Client,
        callback_policy: CallbackPolicy,
    ) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                containers: HashMap::new(),
                remaining: capacity,
                runs: HashMap::new(),
            }),
            backend,
            transformer,
            client,
            callback_policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("registry state poisoned")
    }

    pub fn total_capacity(&self) -> ExecutorResources {
        self.capacity
    }

    pub fn remaining_resources(&self) -> ExecutorResources {
        self.lock().remaining
    }

    /// Snapshot of every record.
    pub fn list(&self) -> Vec<Container> {
        let mut records: Vec<Container> = self.lock().containers.values().cloned().collect();
        records.sort_by(|a, b| a.guid.cmp(&b.guid));
        records
    }

    pub fn get(&self, guid: &str) -> Result<Container, RegistryError> {
        self.lock()
            .containers
            .get(guid)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(guid.to_string()))
    }

    /// Admit a container in `reserved`, deducting its claim from the
    /// remaining capacity. First-fit across memory, disk, and count.
    pub fn allocate(
        &self,
        guid: &str,
        request: AllocationRequest,
    ) -> Result<Container, RegistryError> {
        let mut state = self.lock();

        if state.containers.contains_key(guid) {
            return Err(RegistryError::AlreadyExists(guid.to_string()));
        }
        if request.memory_mb > state.remaining.memory_mb
            || request.disk_mb > state.remaining.disk_mb
            || state.remaining.containers == 0
        {
            return Err(RegistryError::InsufficientResources);
        }

        state.remaining.memory_mb -= request.memory_mb;
        state.remaining.disk_mb -= request.disk_mb;
        state.remaining.containers -= 1;

        let record = Container {
            guid: guid.to_string(),
            memory_mb: request.memory_mb,
            disk_mb: request.disk_mb,
            tags: request.tags,
            allocated_at: Utc::now().timestamp(),
            root_fs: String::new(),
            cpu_weight: 0,
            ports: vec![],
            log: Default::default(),
            actions: vec![],
            env: vec![],
            complete_url: None,
            run_result: ContainerRunResult {
                guid: guid.to_string(),
                ..Default::default()
            },
            state: ContainerState::Reserved,
            container_handle: None,
        };
        state.containers.insert(guid.to_string(), record.clone());

        info!(guid, memory_mb = request.memory_mb, disk_mb = request.disk_mb, "container reserved");
        Ok(record)
    }

    /// Create the backend container. On failure the record transitions
    /// straight to `completed` with the backend error as failure reason and
    /// its resources are refunded.
    pub async fn initialize(
        &self,
        guid: &str,
        request: InitializeRequest,
    ) -> Result<Container, RegistryError> {
        let spec = {
            let mut state = self.lock();
            let record = state
                .containers
                .get_mut(guid)
                .ok_or_else(|| RegistryError::NotFound(guid.to_string()))?;
            if record.state != ContainerState::Reserved {
                return Err(RegistryError::InvalidState {
                    guid: guid.to_string(),
                    expected: ContainerState::Reserved,
                    actual: record.state,
                });
            }
            record.state = ContainerState::Initializing;
            record.root_fs = request.root_fs;
            record.cpu_weight = request.cpu_weight;
            record.ports = request.ports;
            record.log = request.log;
            ContainerSpec {
                guid: guid.to_string(),
                root_fs: record.root_fs.clone(),
                memory_mb: record.memory_mb,
                disk_mb: record.disk_mb,
                cpu_weight: record.cpu_weight,
                ports: record.ports.clone(),
            }
        };

        match self.backend.create(spec).await {
            Ok(handle) => {
                let created = {
                    let mut state = self.lock();
                    match state.containers.get_mut(guid) {
                        Some(record) if record.state == ContainerState::Initializing => {
                            record.state = ContainerState::Created;
                            record.container_handle = Some(handle.0.clone());
                            info!(guid, handle = %handle, "container created");
                            Some(record.clone())
                        }
                        _ => None,
                    }
                };
                match created {
                    Some(record) => Ok(record),
                    None => {
                        // Deleted while we were creating; don't leak the
                        // backend container.
                        self.backend.destroy(&handle).await.ok();
                        Err(RegistryError::NotFound(guid.to_string()))
                    }
                }
            }
            Err(err) => {
                let failure = ContainerRunResult {
                    guid: guid.to_string(),
                    failed: true,
                    failure_reason: err.to_string(),
                };
                let mut state = self.lock();
                complete_record(&mut state, guid, Some(failure));
                warn!(guid, error = %err, "initialize failed");
                Err(RegistryError::Backend(err))
            }
        }
    }

    /// Compile the submitted actions, bind the container to the resulting
    /// step tree, and start it under supervision. Returns once the tree is
    /// started; termination is reported through the complete-url callback.
    pub fn run(self: &Arc<Self>, guid: &str, request: RunRequest) -> Result<(), RegistryError> {
        let (handle, log_config) = {
            let state = self.lock();
            let record = state
                .containers
                .get(guid)
                .ok_or_else(|| RegistryError::NotFound(guid.to_string()))?;
            if record.state != ContainerState::Created {
                return Err(RegistryError::InvalidState {
                    guid: guid.to_string(),
                    expected: ContainerState::Created,
                    actual: record.state,
                });
            }
            let handle = record
                .container_handle
                .clone()
                .expect("created containers carry a backend handle");
            (ContainerHandle(handle), record.log.clone())
        };

        let streamer: Arc<dyn LogStreamer> = Arc::new(TracingLogStreamer::new(&log_config));
        let result_cell: SharedResult = Arc::new(Mutex::new(String::new()));
        let steps = self.transformer.steps_for(
            Arc::clone(&self.backend),
            &handle,
            &request.env,
            streamer,
            &request.actions,
            &result_cell,
        )?;

        let process = launch(Box::new(SerialStep::new(steps)));
        let token = process.cancellation_token();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut state = self.lock();
            match state.containers.get_mut(guid) {
                Some(record) if record.state == ContainerState::Created => {
                    record.actions = request.actions.clone();
                    record.env = request.env.clone();
                    record.complete_url = request.complete_url.clone();
                }
                _ => {
                    // Deleted between compile and bind; unwind the tree.
                    drop(state);
                    token.cancel();
                    tokio::spawn(async move {
                        let _ = process.wait().await;
                    });
                    return Err(RegistryError::NotFound(guid.to_string()));
                }
            }
            state.runs.insert(
                guid.to_string(),
                ActiveRun {
                    token,
                    done: done_rx,
                },
            );
        }

        let registry = Arc::clone(self);
        let guid = guid.to_string();
        let complete_url = request.complete_url;
        tokio::spawn(async move {
            let outcome = process.wait().await;
            registry
                .complete_run(&guid, outcome, result_cell, complete_url)
                .await;
            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Record the terminal outcome, transition to `completed`, and deliver
    /// the callback. The run result is written before the callback is
    /// dispatched; cancelled outcomes post no callback.
    async fn complete_run(
        &self,
        guid: &str,
        outcome: StepResult,
        result_cell: SharedResult,
        complete_url: Option<String>,
    ) {
        let cancelled = matches!(&outcome, Err(err) if err.is_cancelled());
        let run_result = ContainerRunResult {
            guid: guid.to_string(),
            failed: outcome.is_err() && !cancelled,
            failure_reason: match &outcome {
                Err(err) if !cancelled => err.to_string(),
                _ => String::new(),
            },
        };

        {
            let mut state = self.lock();
            state.runs.remove(guid);
            complete_record(&mut state, guid, Some(run_result.clone()));
        }

        let result_value = result_cell.lock().expect("result cell poisoned").clone();
        if cancelled {
            debug!(guid, "run cancelled");
        } else {
            info!(
                guid,
                failed = run_result.failed,
                reason = %run_result.failure_reason,
                result = %result_value,
                "run finished"
            );
        }

        if !cancelled {
            if let Some(url) = complete_url {
                if let Err(err) =
                    post_run_result(&self.client, &url, &run_result, &self.callback_policy).await
                {
                    warn!(guid, error = %err, "failed to deliver run result");
                }
            }
        }
    }

    /// Cancel any live step tree and wait for it to unwind, destroy the
    /// backend container, release resources, and drop the record.
    pub async fn delete(&self, guid: &str) -> Result<(), RegistryError> {
        let active = {
            let state = self.lock();
            if !state.containers.contains_key(guid) {
                return Err(RegistryError::NotFound(guid.to_string()));
            }
            state.runs.get(guid).cloned()
        };

        if let Some(run) = active {
            run.token.cancel();
            let mut done = run.done;
            // Err here means the completion task already dropped the sender,
            // which only happens after it finished.
            let _ = done.wait_for(|finished| *finished).await;
        }

        let handle = {
            let mut state = self.lock();
            let Some(record) = state.containers.remove(guid) else {
                // A concurrent delete won the race; nothing left to do.
                return Ok(());
            };
            if record.state != ContainerState::Completed {
                state.remaining.memory_mb += record.memory_mb;
                state.remaining.disk_mb += record.disk_mb;
                state.remaining.containers += 1;
            }
            record.container_handle
        };

        if let Some(handle) = handle {
            let handle = ContainerHandle(handle);
            if let Err(err) = self.backend.destroy(&handle).await {
                warn!(guid, handle = %handle, error = %err, "failed to destroy backend container");
            }
        }

        info!(guid, "container deleted");
        Ok(())
    }
}

/// The single place a record becomes `completed`: refunds its resources
/// exactly once and stores the terminal result.
fn complete_record(state: &mut State, guid: &str, result: Option<ContainerRunResult>) {
    let Some(record) = state.containers.get_mut(guid) else {
        return;
    };
    let refund =
        (record.state != ContainerState::Completed).then(|| (record.memory_mb, record.disk_mb));
    record.state = ContainerState::Completed;
    if let Some(result) = result {
        record.run_result = result;
    }
    if let Some((memory_mb, disk_mb)) = refund {
        state.remaining.memory_mb += memory_mb;
        state.remaining.disk_mb += disk_mb;
        state.remaining.containers += 1;
    }
}
