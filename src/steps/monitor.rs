//! Periodic health polling with hysteresis.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{launch, ReadySignal, Step, StepError, StepResult};

/// An HTTP request fired when the monitored container changes health state.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub method: Method,
    pub url: Url,
}

/// Builds one fresh probe step per tick.
pub type CheckFactory = Box<dyn Fn() -> Box<dyn Step> + Send + Sync>;

/// Polls a check step at a fixed interval and notifies hooks on health
/// transitions.
///
/// The container starts unhealthy. Reaching `healthy_threshold` consecutive
/// successes fires the healthy hook (and raises ready the first time);
/// reaching `unhealthy_threshold` consecutive failures while healthy fires
/// the unhealthy hook. The step runs until cancelled.
pub struct MonitorStep {
    check: CheckFactory,
    interval: Duration,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    healthy_hook: HookRequest,
    unhealthy_hook: HookRequest,
    client: reqwest::Client,
}

impl MonitorStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        check: CheckFactory,
        interval: Duration,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        healthy_hook: HookRequest,
        unhealthy_hook: HookRequest,
        client: reqwest::Client,
    ) -> Self {
        Self {
            check,
            interval,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_hook,
            unhealthy_hook,
            client,
        }
    }

    async fn notify(&self, hook: &HookRequest, cancel: &CancellationToken) -> StepResult {
        let request = self
            .client
            .request(hook.method.clone(), hook.url.clone())
            .send();
        tokio::select! {
            response = request => {
                match response {
                    Ok(response) if response.status().is_success() => {
                        debug!(url = %hook.url, "hook notified");
                    }
                    Ok(response) => {
                        warn!(url = %hook.url, status = %response.status(), "hook rejected");
                    }
                    Err(err) => {
                        warn!(url = %hook.url, error = %err, "hook request failed");
                    }
                }
                Ok(())
            }
            _ = cancel.cancelled() => Err(StepError::Cancelled),
        }
    }
}

#[async_trait]
impl Step for MonitorStep {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        mut ready: ReadySignal,
    ) -> StepResult {
        let mut healthy = false;
        let mut successes: u32 = 0;
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }

            let mut probe = launch((self.check)());
            let result = tokio::select! {
                result = probe.join() => result,
                _ = cancel.cancelled() => {
                    probe.cancel();
                    let _ = probe.join().await;
                    return Err(StepError::Cancelled);
                }
            };

            match result {
                Ok(()) => {
                    successes += 1;
                    failures = 0;
                }
                Err(err) => {
                    debug!(error = %err, "health probe failed");
                    failures += 1;
                    successes = 0;
                }
            }

            if !healthy && successes >= self.healthy_threshold {
                healthy = true;
                successes = 0;
                info!(url = %self.healthy_hook.url, "monitor transitioned to healthy");
                self.notify(&self.healthy_hook, &cancel).await?;
                ready.signal();
            } else if healthy && failures >= self.unhealthy_threshold {
                healthy = false;
                failures = 0;
                info!(url = %self.unhealthy_hook.url, "monitor transitioned to unhealthy");
                self.notify(&self.unhealthy_hook, &cancel).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::StubStep;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct HookCounts {
        healthy: AtomicUsize,
        unhealthy: AtomicUsize,
    }

    async fn spawn_hook_server() -> (String, Arc<HookCounts>) {
        use axum::{extract::State, routing::post, Router};

        let counts = Arc::new(HookCounts {
            healthy: AtomicUsize::new(0),
            unhealthy: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route(
                "/healthy",
                post(|State(counts): State<Arc<HookCounts>>| async move {
                    counts.healthy.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .route(
                "/unhealthy",
                post(|State(counts): State<Arc<HookCounts>>| async move {
                    counts.unhealthy.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .with_state(Arc::clone(&counts));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), counts)
    }

    /// Probe outcomes are scripted; once exhausted, probes block until
    /// cancelled.
    fn scripted_check(outcomes: Vec<StepResult>) -> CheckFactory {
        let script = Arc::new(Mutex::new(VecDeque::from(outcomes)));
        Box::new(move || {
            let next = script.lock().expect("script poisoned").pop_front();
            let step: Box<dyn Step> = match next {
                Some(Ok(())) => Box::new(StubStep::succeeding()),
                Some(Err(err)) => Box::new(StubStep::failing(err)),
                None => Box::new(StubStep::until_cancelled()),
            };
            step
        })
    }

    fn monitor(check: CheckFactory, base: &str, healthy: u32, unhealthy: u32) -> Box<MonitorStep> {
        Box::new(MonitorStep::new(
            check,
            Duration::from_millis(10),
            healthy,
            unhealthy,
            HookRequest {
                method: Method::POST,
                url: Url::parse(&format!("{base}/healthy")).expect("url"),
            },
            HookRequest {
                method: Method::POST,
                url: Url::parse(&format!("{base}/unhealthy")).expect("url"),
            },
            reqwest::Client::new(),
        ))
    }

    #[tokio::test]
    async fn consecutive_successes_fire_the_healthy_hook_and_raise_ready() {
        let (base, counts) = spawn_hook_server().await;
        let check = scripted_check(vec![Ok(()), Ok(())]);
        let step = monitor(check, &base, 2, 1);

        let mut process = launch(step);
        let ready = process.take_ready();
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .expect("ready within deadline")
            .expect("monitor becomes ready");

        assert_eq!(counts.healthy.load(Ordering::SeqCst), 1);
        assert_eq!(counts.unhealthy.load(Ordering::SeqCst), 0);

        process.cancel();
        let result = process.wait().await;
        assert!(matches!(result, Err(StepError::Cancelled)));
    }

    #[tokio::test]
    async fn hysteresis_requires_consecutive_failures() {
        let (base, counts) = spawn_hook_server().await;
        // Healthy after one success, then fail/success alternation never
        // reaches the two-failure threshold, then two failures do.
        let check = scripted_check(vec![
            Ok(()),
            Err(StepError::ExitStatus(1)),
            Ok(()),
            Err(StepError::ExitStatus(1)),
            Err(StepError::ExitStatus(1)),
        ]);
        let step = monitor(check, &base, 1, 2);

        let mut process = launch(step);
        let ready = process.take_ready();
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .expect("ready within deadline")
            .expect("monitor becomes ready");

        // Wait for the script to be consumed and the transition to land.
        tokio::time::timeout(Duration::from_secs(5), async {
            while counts.unhealthy.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("unhealthy hook within deadline");

        assert_eq!(counts.healthy.load(Ordering::SeqCst), 1);
        assert_eq!(counts.unhealthy.load(Ordering::SeqCst), 1);

        process.cancel();
        let result = process.wait().await;
        assert!(matches!(result, Err(StepError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_probe() {
        let (base, _counts) = spawn_hook_server().await;
        // No scripted outcomes: the first probe blocks until cancelled.
        let step = monitor(scripted_check(vec![]), &base, 1, 1);

        let process = launch(step);
        tokio::time::sleep(Duration::from_millis(50)).await;
        process.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("cancel unblocks the monitor");
        assert!(matches!(result, Err(StepError::Cancelled)));
    }
}
