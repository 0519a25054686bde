//! Compilation of action trees into step trees.
//!
//! Compilation is pure: one case per action variant, recursing on children,
//! with every side effect deferred to the step's `run`. The only errors are
//! a monitor without an interval and malformed hook requests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use thiserror::Error;
use url::Url;

use crate::api::{Action, EnvironmentVariable, HookDefinition};
use crate::backend::{ContainerBackend, ContainerHandle};
use crate::downloader::Downloader;
use crate::log_streamer::LogStreamer;
use crate::steps::{
    CodependentStep, DownloadStep, EmitProgressStep, FetchResultStep, HookRequest, MonitorStep,
    ParallelStep, RunStep, SerialStep, SharedResult, Step, TryStep, UploadStep,
};
use crate::uploader::Uploader;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no interval configured")]
    NoInterval,
    #[error("invalid hook url {url}: {source}")]
    InvalidHookUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid hook method: {0}")]
    InvalidHookMethod(String),
}

/// Compiles action trees against the shared sinks.
pub struct Transformer {
    downloader: Arc<dyn Downloader>,
    uploader: Arc<dyn Uploader>,
    client: reqwest::Client,
    temp_dir: PathBuf,
}

impl Transformer {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        uploader: Arc<dyn Uploader>,
        client: reqwest::Client,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            downloader,
            uploader,
            client,
            temp_dir,
        }
    }

    /// Compile one step per top-level action.
    #[allow(clippy::too_many_arguments)]
    pub fn steps_for(
        &self,
        backend: Arc<dyn ContainerBackend>,
        handle: &ContainerHandle,
        container_env: &[EnvironmentVariable],
        streamer: Arc<dyn LogStreamer>,
        actions: &[Action],
        result: &SharedResult,
    ) -> Result<Vec<Box<dyn Step>>, TransformError> {
        let context = CompileContext {
            backend,
            handle: handle.clone(),
            env: container_env
                .iter()
                .map(|var| (var.name.clone(), var.value.clone()))
                .collect(),
            streamer,
            downloader: Arc::clone(&self.downloader),
            uploader: Arc::clone(&self.uploader),
            client: self.client.clone(),
            temp_dir: self.temp_dir.clone(),
            result: Arc::clone(result),
        };

        actions
            .iter()
            .map(|action| convert(&context, action))
            .collect()
    }
}

#[derive(Clone)]
struct CompileContext {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    env: Vec<(String, String)>,
    streamer: Arc<dyn LogStreamer>,
    downloader: Arc<dyn Downloader>,
    uploader: Arc<dyn Uploader>,
    client: reqwest::Client,
    temp_dir: PathBuf,
    result: SharedResult,
}

fn convert(context: &CompileContext, action: &Action) -> Result<Box<dyn Step>, TransformError> {
    match action {
        Action::Run(model) => {
            let mut env = context.env.clone();
            env.extend(
                model
                    .env
                    .iter()
                    .map(|var| (var.name.clone(), var.value.clone())),
            );
            Ok(Box::new(RunStep::new(
                Arc::clone(&context.backend),
                context.handle.clone(),
                model.clone(),
                env,
                Arc::clone(&context.streamer),
            )))
        }
        Action::Download(model) => Ok(Box::new(DownloadStep::new(
            Arc::clone(&context.backend),
            context.handle.clone(),
            model.clone(),
            Arc::clone(&context.downloader),
            Arc::clone(&context.streamer),
            context.temp_dir.clone(),
        ))),
        Action::Upload(model) => Ok(Box::new(UploadStep::new(
            Arc::clone(&context.backend),
            context.handle.clone(),
            model.clone(),
            Arc::clone(&context.uploader),
            Arc::clone(&context.streamer),
            context.temp_dir.clone(),
        ))),
        Action::FetchResult(model) => Ok(Box::new(FetchResultStep::new(
            Arc::clone(&context.backend),
            context.handle.clone(),
            model.clone(),
            Arc::clone(&context.result),
        ))),
        Action::EmitProgress(model) => {
            let child = convert(context, &model.action)?;
            Ok(Box::new(EmitProgressStep::new(
                child,
                model.start_message.clone(),
                model.success_message.clone(),
                model.failure_message.clone(),
                Arc::clone(&context.streamer),
            )))
        }
        Action::Try(model) => {
            let child = convert(context, &model.action)?;
            Ok(Box::new(TryStep::new(child)))
        }
        Action::Monitor(model) => {
            let interval = model
                .interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .ok_or(TransformError::NoInterval)?;
            let healthy_hook = parse_hook(&model.healthy_hook)?;
            let unhealthy_hook = parse_hook(&model.unhealthy_hook)?;

            // Surface child compile errors now; the factory then rebuilds
            // the same check on every tick.
            convert(context, &model.action)?;
            let check_context = context.clone();
            let check_action = (*model.action).clone();
            let check = Box::new(move || {
                convert(&check_context, &check_action)
                    .expect("monitor check validated during transform")
            });

            Ok(Box::new(MonitorStep::new(
                check,
                interval,
                model.healthy_threshold,
                model.unhealthy_threshold,
                healthy_hook,
                unhealthy_hook,
                context.client.clone(),
            )))
        }
        Action::Parallel(model) => {
            let children = model
                .actions
                .iter()
                .map(|child| convert(context, child))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(ParallelStep::new(children)))
        }
        Action::Codependent(model) => {
            let children = model
                .actions
                .iter()
                .map(|child| convert(context, child))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(CodependentStep::new(
                children,
                model.error_on_exit,
                model.cancel_others_on_exit,
            )))
        }
        Action::Serial(model) => {
            let children = model
                .actions
                .iter()
                .map(|child| convert(context, child))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(SerialStep::new(children)))
        }
    }
}

fn parse_hook(definition: &HookDefinition) -> Result<HookRequest, TransformError> {
    let url = Url::parse(&definition.url).map_err(|source| TransformError::InvalidHookUrl {
        url: definition.url.clone(),
        source,
    })?;
    let method = Method::from_bytes(definition.method.as_bytes())
        .map_err(|_| TransformError::InvalidHookMethod(definition.method.clone()))?;
    Ok(HookRequest { method, url })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        DownloadActionModel, MonitorActionModel, ParallelActionModel, RunActionModel,
        TryActionModel,
    };
    use crate::backend_local::LocalBackend;
    use crate::downloader::CachedDownloader;
    use crate::log_streamer::InMemoryLogStreamer;
    use crate::uploader::HttpUploader;
    use std::sync::Mutex;

    fn transformer(temp: &std::path::Path) -> Transformer {
        let client = reqwest::Client::new();
        Transformer::new(
            Arc::new(CachedDownloader::new(client.clone(), temp.join("cache"))),
            Arc::new(HttpUploader::new(client.clone())),
            client,
            temp.to_path_buf(),
        )
    }

    fn compile(actions: &[Action]) -> Result<Vec<Box<dyn Step>>, TransformError> {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(LocalBackend::new(temp.path().join("sandboxes")));
        let result: SharedResult = Arc::new(Mutex::new(String::new()));
        transformer(temp.path()).steps_for(
            backend,
            &ContainerHandle("c-1".to_string()),
            &[],
            InMemoryLogStreamer::new(),
            actions,
            &result,
        )
    }

    fn run_true() -> Action {
        Action::Run(RunActionModel {
            path: "/bin/true".to_string(),
            args: vec![],
            env: vec![],
            timeout_ms: None,
            resource_limits: None,
        })
    }

    #[test]
    fn compiles_one_step_per_action() {
        let steps = compile(&[
            run_true(),
            Action::Download(DownloadActionModel {
                from: "http://assets.test/a".to_string(),
                to: "/a".to_string(),
                extract: false,
                cache_key: None,
            }),
        ])
        .expect("compile");
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn compiles_nested_composites() {
        let steps = compile(&[Action::Parallel(ParallelActionModel {
            actions: vec![
                Action::Try(TryActionModel {
                    action: Box::new(run_true()),
                }),
                run_true(),
            ],
        })])
        .expect("compile");
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn monitor_without_interval_is_rejected() {
        let monitor = Action::Monitor(MonitorActionModel {
            action: Box::new(run_true()),
            interval_ms: None,
            healthy_threshold: 1,
            unhealthy_threshold: 1,
            healthy_hook: HookDefinition {
                method: "POST".to_string(),
                url: "http://hooks.test/healthy".to_string(),
            },
            unhealthy_hook: HookDefinition {
                method: "POST".to_string(),
                url: "http://hooks.test/unhealthy".to_string(),
            },
        });

        let err = compile(&[monitor]).err().expect("should reject");
        assert!(matches!(err, TransformError::NoInterval));
    }

    #[test]
    fn monitor_with_malformed_hook_url_is_rejected() {
        let monitor = Action::Monitor(MonitorActionModel {
            action: Box::new(run_true()),
            interval_ms: Some(1_000),
            healthy_threshold: 1,
            unhealthy_threshold: 1,
            healthy_hook: HookDefinition {
                method: "POST".to_string(),
                url: "not a url".to_string(),
            },
            unhealthy_hook: HookDefinition {
                method: "POST".to_string(),
                url: "http://hooks.test/unhealthy".to_string(),
            },
        });

        let err = compile(&[monitor]).err().expect("should reject");
        assert!(matches!(err, TransformError::InvalidHookUrl { .. }));
    }

    #[test]
    fn child_errors_surface_through_composites() {
        let nested = Action::Serial(crate::api::SerialActionModel {
            actions: vec![Action::Monitor(MonitorActionModel {
                action: Box::new(run_true()),
                interval_ms: Some(0),
                healthy_threshold: 1,
                unhealthy_threshold: 1,
                healthy_hook: HookDefinition {
                    method: "POST".to_string(),
                    url: "http://hooks.test/healthy".to_string(),
                },
                unhealthy_hook: HookDefinition {
                    method: "POST".to_string(),
                    url: "http://hooks.test/unhealthy".to_string(),
                },
            })],
        });

        let err = compile(&[nested]).err().expect("should reject");
        assert!(matches!(err, TransformError::NoInterval));
    }
}
