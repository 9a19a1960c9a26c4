use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{Environment, SlotName};

/// Everything the proxy needs to serve one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSpec {
    pub project: String,
    pub environment: Environment,
    pub domain: String,
    /// Upstream host ports, active slot first. Order is the fail-over
    /// order: the proxy sticks to the first upstream while it is healthy.
    pub upstreams: Vec<u16>,
    pub active_slot: SlotName,
    /// Image reference surfaced in the X-Version response header.
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("generated configuration is invalid: {0}")]
    ConfigInvalid(String),
    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Owns the per-scope site files and the reload protocol. Reloads must be
/// zero-downtime and must never overlap; implementations serialize them.
#[async_trait]
pub trait ProxyConfigurator: Send + Sync + 'static {
    /// Atomically replace the scope's site file and reload the proxy.
    /// The previous file is kept as a backup and restored on failure.
    async fn render_and_reload(&self, site: &SiteSpec) -> Result<(), ProxyError>;

    /// Delete the scope's site file and reload.
    async fn remove_site(&self, project: &str, environment: Environment) -> Result<(), ProxyError>;
}
