//! Berth - a per-node container execution agent
//!
//! Berth accepts container descriptions from a scheduler over an HTTP
//! control plane, admits them against the node's declared resources,
//! materializes them through a container backend, and runs each container's
//! compound action program under supervision. The key components are:
//!
//! ## Execution engine
//!
//! - [`steps`]: the supervised step model: leaves (run, download, upload,
//!   fetch-result), composites (serial, parallel, codependent, try,
//!   emit-progress), and the health-check and monitor supervisors
//! - [`Transformer`]: compiles declarative action trees into step trees
//!
//! ## Node surface
//!
//! - [`Registry`]: admission, the container state machine, and run binding
//! - [`AgentServer`]: the HTTP control plane
//! - [`ContainerBackend`]: the narrow isolation-provider contract, with
//!   [`LocalBackend`] as the host-process implementation

pub mod api;
pub mod backend;
pub mod backend_local;
pub mod callback;
pub mod config;
pub mod downloader;
pub mod log_streamer;
pub mod registry;
pub mod server;
pub mod steps;
pub mod transformer;
pub mod uploader;

// Configuration
pub use config::Config;

// Transport types
pub use api::{
    Action, AllocationRequest, Container, ContainerRunResult, ContainerState,
    EnvironmentVariable, ExecutorResources, InitializeRequest, LogConfig, PortMapping,
    RunRequest,
};

// Execution engine
pub use steps::{launch, ReadySignal, Step, StepError, StepProcess, StepResult};
pub use transformer::{TransformError, Transformer};

// Node surface
pub use backend::{BackendError, ContainerBackend, ContainerHandle, ContainerSpec, ProcessSpec};
pub use backend_local::LocalBackend;
pub use callback::CallbackPolicy;
pub use downloader::{CachedDownloader, Downloader};
pub use log_streamer::{InMemoryLogStreamer, LogStreamer, TracingLogStreamer};
pub use registry::{Registry, RegistryError};
pub use server::{build_router, AgentServer};
pub use uploader::{HttpUploader, Uploader};
