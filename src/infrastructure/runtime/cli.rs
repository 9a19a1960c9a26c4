use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::application::ports::container_runtime::{
    ContainerRuntime, HealthState, PullError, RunSpec,
};

const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

const PULL_ATTEMPTS: u32 = 3;
const PULL_BACKOFF: Duration = Duration::from_secs(2);

/// Container runtime driver that shells to a single runtime binary
/// (docker, podman). Every command runs under a hard timeout; a command
/// that outlives it is killed and reported as a transient failure.
#[derive(Clone)]
pub struct CliRuntime {
    bin: String,
}

struct CmdOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CliRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn exec(&self, args: &[&str], limit: Duration) -> Result<CmdOutput> {
        debug!("{} {}", self.bin, args.join(" "));
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(limit, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!("{} {} timed out after {}s", self.bin, args.join(" "), limit.as_secs())
            })?
            .with_context(|| format!("Failed to execute {}", self.bin))?;

        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Pull failures that retrying will not fix: the image reference itself
/// is wrong or access is denied.
fn is_permanent_pull_failure(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    [
        "manifest unknown",
        "not found",
        "repository does not exist",
        "access denied",
        "denied",
        "unauthorized",
        "invalid reference format",
    ]
    .iter()
    .any(|needle| s.contains(needle))
}

fn is_absent_container_error(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("no such container") || s.contains("no such object")
}

/// Parse the runtime's `ps --format '{{.Ports}}'` output into the set of
/// published host ports. Lines look like
/// `0.0.0.0:4100->3000/tcp, [::]:4100->3000/tcp`.
fn parse_published_ports(output: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for line in output.lines() {
        for mapping in line.split(',') {
            let Some((host_part, _)) = mapping.trim().split_once("->") else {
                continue;
            };
            if let Some(port) = host_part.rsplit(':').next() {
                if let Ok(port) = port.parse::<u16>() {
                    ports.insert(port);
                }
            }
        }
    }
    ports
}

fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--restart".to_string(),
        spec.restart_policy.clone(),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
    ];

    if let Some(env_file) = &spec.env_file {
        args.push("--env-file".to_string());
        args.push(env_file.display().to_string());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(health_cmd) = &spec.health_cmd {
        args.push("--health-cmd".to_string());
        args.push(health_cmd.clone());
        args.push("--health-interval".to_string());
        args.push("10s".to_string());
        args.push("--health-timeout".to_string());
        args.push("5s".to_string());
        args.push("--health-retries".to_string());
        args.push("3".to_string());
    }

    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn pull(&self, image: &str) -> Result<(), PullError> {
        for attempt in 1..=PULL_ATTEMPTS {
            match self.exec(&["pull", image], PULL_TIMEOUT).await {
                Ok(out) if out.success => {
                    info!("Image {} pulled", image);
                    return Ok(());
                }
                Ok(out) => {
                    if is_permanent_pull_failure(&out.stderr) {
                        warn!("Pull of {} failed permanently: {}", image, out.stderr);
                        return Err(PullError::Permanent(out.stderr));
                    }
                    warn!(
                        "Pull attempt {}/{} for {} failed: {}",
                        attempt, PULL_ATTEMPTS, image, out.stderr
                    );
                    if attempt == PULL_ATTEMPTS {
                        return Err(PullError::Transient(out.stderr));
                    }
                }
                Err(e) => {
                    warn!("Pull attempt {}/{} for {} failed: {}", attempt, PULL_ATTEMPTS, image, e);
                    if attempt == PULL_ATTEMPTS {
                        return Err(PullError::Transient(e.to_string()));
                    }
                }
            }
            // 2s, 4s, ... between attempts.
            sleep(PULL_BACKOFF * 2u32.pow(attempt - 1)).await;
        }
        unreachable!("pull retry loop always returns");
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        // A stale container with our name blocks the new one. Stop and
        // remove it first; both tolerate absence.
        self.stop(&spec.name).await.ok();
        self.remove(&spec.name).await.ok();

        let args = build_run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.exec(&arg_refs, RUN_TIMEOUT).await?;
        if !out.success {
            anyhow::bail!(
                "Failed to start container '{}' on port {}: {}",
                spec.name,
                spec.host_port,
                out.stderr
            );
        }

        let container_id = out
            .stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if container_id.is_empty() {
            anyhow::bail!("Runtime returned no container id for '{}'", spec.name);
        }
        info!("Container {} started ({})", spec.name, &container_id[..container_id.len().min(12)]);
        Ok(container_id)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let out = self.exec(&["stop", "-t", "10", name], STOP_TIMEOUT).await?;
        if !out.success && !is_absent_container_error(&out.stderr) {
            anyhow::bail!("Failed to stop container {}: {}", name, out.stderr);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let out = self.exec(&["rm", "-f", name], STOP_TIMEOUT).await?;
        if !out.success && !is_absent_container_error(&out.stderr) {
            anyhow::bail!("Failed to remove container {}: {}", name, out.stderr);
        }
        Ok(())
    }

    async fn inspect_health(&self, name: &str) -> Result<HealthState> {
        let format = "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}";
        let out = self
            .exec(&["inspect", "--format", format, name], INSPECT_TIMEOUT)
            .await?;
        if !out.success {
            if is_absent_container_error(&out.stderr) {
                return Ok(HealthState::None);
            }
            anyhow::bail!("Failed to inspect container {}: {}", name, out.stderr);
        }
        Ok(match out.stdout.as_str() {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            "starting" => HealthState::Starting,
            _ => HealthState::None,
        })
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .exec(&["inspect", "--format", "{{.State.Running}}", name], INSPECT_TIMEOUT)
            .await?;
        if !out.success {
            if is_absent_container_error(&out.stderr) {
                return Ok(false);
            }
            anyhow::bail!("Failed to inspect container {}: {}", name, out.stderr);
        }
        Ok(out.stdout == "true")
    }

    async fn probe_http(&self, name: &str, port: u16, path: &str) -> Result<bool> {
        let url = format!("http://127.0.0.1:{}{}", port, path);
        let probe = format!(
            "curl -fsS -o /dev/null {url} || wget -q -O /dev/null {url}",
            url = url
        );
        match self
            .exec(&["exec", name, "sh", "-c", probe.as_str()], EXEC_TIMEOUT)
            .await
        {
            Ok(out) => Ok(out.success),
            // Timeouts and exec failures just mean this signal said no.
            Err(e) => {
                debug!("In-container probe of {} failed: {}", name, e);
                Ok(false)
            }
        }
    }

    async fn published_host_ports(&self) -> Result<HashSet<u16>> {
        let out = self
            .exec(&["ps", "--format", "{{.Ports}}"], INSPECT_TIMEOUT)
            .await?;
        if !out.success {
            anyhow::bail!("Failed to list published ports: {}", out.stderr);
        }
        Ok(parse_published_ports(&out.stdout))
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let out = self
            .exec(&["ps", "-a", "--format", "{{.Names}}"], INSPECT_TIMEOUT)
            .await?;
        if !out.success {
            anyhow::bail!("Failed to list containers: {}", out.stderr);
        }
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .collect())
    }
}
