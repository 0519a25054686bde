//! Control-plane transport types.
//!
//! These are the JSON shapes exchanged with the scheduler: the container
//! record in its four lifecycle states, the request bodies for the three
//! mutating operations, and the declarative action tree that `run` submits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an admitted container.
///
/// Transitions form a DAG: reserved → initializing → created → completed,
/// plus the shortcut edges reserved → completed (deleted before initialize)
/// and initializing → completed (initialize failure). Nothing is reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Reserved,
    Initializing,
    Created,
    Completed,
}

/// One admitted workload, keyed by an externally assigned guid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub guid: String,

    // alloc
    pub memory_mb: u64,
    pub disk_mb: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    pub allocated_at: i64,

    // init
    #[serde(default)]
    pub root_fs: String,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub log: LogConfig,

    // run
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_url: Option<String>,

    pub run_result: ContainerRunResult,

    // internally updated
    pub state: ContainerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// Routing metadata for the container's log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub host_port: u16,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

/// Terminal outcome of a container's action program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRunResult {
    pub guid: String,
    pub failed: bool,
    pub failure_reason: String,
}

/// The node's declared capacity across the three admission axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResources {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u64,
}

/// Body of `POST /containers/{guid}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub memory_mb: u64,
    pub disk_mb: u64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Body of `POST /containers/{guid}/initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeRequest {
    #[serde(default)]
    pub root_fs: String,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Body of `POST /containers/{guid}/run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub complete_url: Option<String>,
}

/// A declarative description of work. Nodes own their children and form a
/// finite tree; the transformer compiles each node into one runnable step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "snake_case")]
pub enum Action {
    Run(RunActionModel),
    Download(DownloadActionModel),
    Upload(UploadActionModel),
    FetchResult(FetchResultActionModel),
    EmitProgress(EmitProgressActionModel),
    Try(TryActionModel),
    Monitor(MonitorActionModel),
    Parallel(ParallelActionModel),
    Codependent(CodependentActionModel),
    Serial(SerialActionModel),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunActionModel {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    /// Milliseconds; absent or zero means no deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub nofile: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadActionModel {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadActionModel {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResultActionModel {
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitProgressActionModel {
    pub action: Box<Action>,
    #[serde(default)]
    pub start_message: String,
    #[serde(default)]
    pub success_message: String,
    #[serde(default)]
    pub failure_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryActionModel {
    pub action: Box<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorActionModel {
    pub action: Box<Action>,
    /// Milliseconds between probes. Absent or zero is a compile error.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub healthy_threshold: u32,
    #[serde(default)]
    pub unhealthy_threshold: u32,
    pub healthy_hook: HookDefinition,
    pub unhealthy_hook: HookDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDefinition {
    #[serde(default = "default_hook_method")]
    pub method: String,
    pub url: String,
}

fn default_hook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelActionModel {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodependentActionModel {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub error_on_exit: bool,
    #[serde(default)]
    pub cancel_others_on_exit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialActionModel {
    pub actions: Vec<Action>,
}
