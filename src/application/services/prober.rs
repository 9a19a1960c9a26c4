use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::container_runtime::{ContainerRuntime, HealthState};

pub const DEFAULT_HEALTH_PATH: &str = "/health";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy,
    Cancelled,
}

/// Layered liveness check for a freshly started replica.
///
/// Each round consults three signals and accepts on the first success:
/// the runtime's own health state (authoritative when a health command is
/// configured), an HTTP probe from inside the container (immune to host
/// networking pathologies), and an HTTP probe from the host (the external
/// reality). The prober never tears anything down; what happens to an
/// unhealthy container is the coordinator's policy.
pub struct HealthProber<R: ContainerRuntime> {
    runtime: Arc<R>,
    client: reqwest::Client,
}

impl<R: ContainerRuntime> HealthProber<R> {
    pub fn new(runtime: Arc<R>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to create health check HTTP client")?;
        Ok(Self { runtime, client })
    }

    pub async fn wait_healthy(
        &self,
        container: &str,
        host_port: u16,
        container_port: u16,
        path: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let started = Instant::now();
        let host_url = format!("http://localhost:{}{}", host_port, path);
        let mut round = 0u32;

        loop {
            round += 1;

            match self.runtime.inspect_health(container).await {
                Ok(HealthState::Healthy) => {
                    info!("Container {} healthy (runtime health state, round {})", container, round);
                    return ProbeOutcome::Healthy;
                }
                Ok(state) => debug!("Container {} runtime health: {:?}", container, state),
                Err(e) => debug!("Health inspect of {} failed: {}", container, e),
            }

            if matches!(
                self.runtime.probe_http(container, container_port, path).await,
                Ok(true)
            ) {
                info!("Container {} healthy (in-container probe, round {})", container, round);
                return ProbeOutcome::Healthy;
            }

            match self.client.get(&host_url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        info!(
                            "Container {} healthy (HTTP {} from {}, round {})",
                            container, status, host_url, round
                        );
                        return ProbeOutcome::Healthy;
                    }
                    debug!("Probe of {} returned HTTP {}", host_url, status);
                }
                Err(e) => debug!("Probe of {} failed: {}", host_url, e),
            }

            if started.elapsed() >= deadline {
                warn!(
                    "Container {} not healthy after {} rounds ({}s deadline)",
                    container,
                    round,
                    deadline.as_secs()
                );
                return ProbeOutcome::Unhealthy;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health probe of {} cancelled by client", container);
                    return ProbeOutcome::Cancelled;
                }
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
    }
}
