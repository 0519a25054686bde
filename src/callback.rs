//! Run-result delivery to the caller's complete-url.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::api::ContainerRunResult;

#[derive(Debug, Error)]
#[error("callback to {url} gave up after {attempts} attempts")]
pub struct CallbackError {
    pub url: String,
    pub attempts: u32,
}

/// Bounded exponential backoff for result callbacks.
#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// POST the run result to `url`, retrying with exponential backoff. The
/// container record stays completed whether or not delivery succeeds.
pub async fn post_run_result(
    client: &reqwest::Client,
    url: &str,
    result: &ContainerRunResult,
    policy: &CallbackPolicy,
) -> Result<(), CallbackError> {
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        match client.post(url).json(result).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, guid = %result.guid, attempt, "run result delivered");
                return Ok(());
            }
            Ok(response) => {
                warn!(url, status = %response.status(), attempt, "callback rejected");
            }
            Err(err) => {
                warn!(url, error = %err, attempt, "callback request failed");
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.base_delay * 2u32.pow(attempt)).await;
        }
    }

    Err(CallbackError {
        url: url.to_string(),
        attempts,
    })
}
