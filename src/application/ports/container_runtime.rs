use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Runtime-reported health of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    /// The container has no health command configured (or does not exist).
    None,
}

/// Everything needed to start a replica container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    /// Env file handed to the runtime verbatim, if the scope has one.
    pub env_file: Option<PathBuf>,
    /// Fallback variables applied when no env file exists.
    pub env: Vec<(String, String)>,
    pub network: String,
    pub restart_policy: String,
    /// In-container health command (shell form). None disables the
    /// runtime health check for this container.
    pub health_cmd: Option<String>,
}

#[derive(Debug, Error)]
pub enum PullError {
    /// Network trouble, registry rate limits. Retried by the driver.
    #[error("transient pull failure: {0}")]
    Transient(String),
    /// Manifest unknown, access denied. Not worth retrying.
    #[error("permanent pull failure: {0}")]
    Permanent(String),
}

/// Container runtime operations (docker, podman).
///
/// Implementations must never block indefinitely: every operation carries
/// a hard timeout and a timed-out command surfaces as an error, not a hang.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pull an image, retrying transient failures.
    async fn pull(&self, image: &str) -> Result<(), PullError>;

    /// Start a container. Idempotent against a stale container with the
    /// same name: the old one is stopped and removed first. Returns the
    /// new container id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Stop a container. Succeeds if the container is absent.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Remove a container. Succeeds if the container is absent.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Runtime-reported health state for a container.
    async fn inspect_health(&self, name: &str) -> Result<HealthState>;

    /// Whether the named container is currently running.
    async fn is_running(&self, name: &str) -> Result<bool>;

    /// HTTP GET against `localhost:{port}{path}` from inside the
    /// container. True on a 2xx/3xx response.
    async fn probe_http(&self, name: &str, port: u16, path: &str) -> Result<bool>;

    /// Host ports currently published by any container the runtime knows.
    async fn published_host_ports(&self) -> Result<HashSet<u16>>;

    /// Names of all containers (running or not) with the given prefix.
    /// An empty prefix lists everything.
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>>;
}
