use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Process configuration, collected from environment variables once at
/// startup. A `.env` file in the working directory is honored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the filesystem registry (`ssot.json`, `slots/`, `env/`).
    pub registry_root: PathBuf,
    /// Root of the proxy configuration (`Caddyfile`, `sites/`, `logs/`).
    pub proxy_root: PathBuf,
    /// Shared application network containers attach to.
    pub app_network: String,
    /// Container runtime binary (docker, podman).
    pub runtime_bin: String,
    /// Reverse proxy binary.
    pub proxy_bin: String,
    /// DSN for the relational mirror. Absent disables mirroring.
    pub database_url: Option<String>,
    /// Base domain for proxied sites, e.g. `apps.example.com`.
    pub base_domain: String,
    /// Host name used in preview URLs returned to clients.
    pub public_host: String,
    /// API listen address.
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let registry_root = PathBuf::from(
            std::env::var("REGISTRY_ROOT").unwrap_or_else(|_| "/var/lib/bluegreend".to_string()),
        );
        let proxy_root = PathBuf::from(
            std::env::var("PROXY_ROOT").unwrap_or_else(|_| "/etc/caddy".to_string()),
        );
        let app_network =
            std::env::var("APP_NETWORK").unwrap_or_else(|_| "bluegreen".to_string());
        let runtime_bin =
            std::env::var("CONTAINER_RUNTIME_BIN").unwrap_or_else(|_| "docker".to_string());
        let proxy_bin = std::env::var("PROXY_BIN").unwrap_or_else(|_| "caddy".to_string());
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        let base_domain = std::env::var("BASE_DOMAIN").unwrap_or_else(|_| "localhost".to_string());
        let public_host = std::env::var("PUBLIC_HOST").unwrap_or_else(|_| "localhost".to_string());

        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDR is not a valid socket address")?;

        if runtime_bin.trim().is_empty() {
            anyhow::bail!("CONTAINER_RUNTIME_BIN must not be empty");
        }

        Ok(Self {
            registry_root,
            proxy_root,
            app_network,
            runtime_bin,
            proxy_bin,
            database_url,
            base_domain,
            public_host,
            bind_addr,
        })
    }

}
