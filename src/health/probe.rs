use std::time::Duration;

use tracing::{debug, info};

use crate::docker::DockerClient;
use crate::error::{ErrorKind, PilotError, Result};

/// Interval between probe attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Window a non-HTTP container must stay running without a restart.
const STATE_SETTLE: Duration = Duration::from_secs(2);

/// HTTP GET `base_url + endpoint`, expecting 200 within `timeout` per
/// attempt, up to `retries` attempts with 2 s between them.
pub async fn probe_http(
    base_url: &str,
    endpoint: &str,
    retries: u32,
    timeout: Duration,
) -> Result<()> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PilotError::new(ErrorKind::ProbeFailed, e.to_string()))?;

    let attempts = retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!(url, attempt, "health probe passed");
                return Ok(());
            }
            Ok(response) => {
                last_error = format!("status {}", response.status());
            }
            Err(e) if e.is_timeout() => {
                last_error = "attempt timed out".into();
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }

        debug!(url, attempt, %last_error, "health probe attempt failed");
        if attempt < attempts {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    let kind = if last_error == "attempt timed out" {
        ErrorKind::ProbeTimeout
    } else {
        ErrorKind::ProbeFailed
    };
    Err(PilotError::new(
        kind,
        format!("{} failed after {} attempts: {}", url, attempts, last_error),
    ))
}

/// Readiness for images on the non-HTTP allow-list: the container must be
/// running for at least 2 s without restarting.
pub async fn wait_ready_state(client: &DockerClient, name: &str) -> Result<()> {
    let before = client.inspect_container(name).await?;
    let restarts_before = before.restart_count.unwrap_or(0);
    if !container_running(&before) {
        return Err(PilotError::new(
            ErrorKind::ProbeFailed,
            format!("{} is not running", name),
        ));
    }

    tokio::time::sleep(STATE_SETTLE).await;

    let after = client.inspect_container(name).await?;
    let restarts_after = after.restart_count.unwrap_or(0);
    if !container_running(&after) || restarts_after > restarts_before {
        return Err(PilotError::new(
            ErrorKind::ProbeFailed,
            format!("{} restarted during settle window", name),
        ));
    }

    Ok(())
}

fn container_running(inspect: &bollard::models::ContainerInspectResponse) -> bool {
    inspect
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}
