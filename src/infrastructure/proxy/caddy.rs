use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::application::ports::proxy::{ProxyConfigurator, ProxyError, SiteSpec};
use crate::registry::{scope_key, Environment};

const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the per-scope Caddy site files and the reload protocol.
///
/// Layout under PROXY_ROOT:
///   Caddyfile            operator-owned entry point, imports sites/*.caddy
///   sites/{scope}.caddy  one generated site block per scope
///   logs/{scope}.access.log
///
/// Caddy reloads are graceful: the running process adopts the new
/// configuration and drains existing connections, so a cut-over never
/// drops in-flight requests. Caddy cannot accept overlapping reloads;
/// a single mutex serializes write+validate+reload across all scopes.
pub struct CaddyConfigurator {
    root: PathBuf,
    bin: String,
    reload_lock: tokio::sync::Mutex<()>,
}

impl CaddyConfigurator {
    pub fn new(root: impl Into<PathBuf>, bin: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bin: bin.into(),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create the directory layout and seed the entry-point Caddyfile if
    /// the operator has not provided one.
    pub async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("sites"))
            .await
            .context("Failed to create proxy sites directory")?;
        tokio::fs::create_dir_all(self.root.join("logs"))
            .await
            .context("Failed to create proxy logs directory")?;

        let caddyfile = self.caddyfile_path();
        if !caddyfile.exists() {
            tokio::fs::write(&caddyfile, "import sites/*.caddy\n")
                .await
                .context("Failed to seed Caddyfile")?;
            info!("Seeded {}", caddyfile.display());
        }
        Ok(())
    }

    fn caddyfile_path(&self) -> PathBuf {
        self.root.join("Caddyfile")
    }

    fn site_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.root
            .join("sites")
            .join(format!("{}.caddy", scope_key(project, environment)))
    }

    fn log_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.root
            .join("logs")
            .join(format!("{}.access.log", scope_key(project, environment)))
    }

    async fn caddy(&self, subcommand: &str) -> Result<(bool, String)> {
        let caddyfile = self.caddyfile_path();
        let mut cmd = Command::new(&self.bin);
        cmd.arg(subcommand)
            .arg("--config")
            .arg(&caddyfile)
            .arg("--adapter")
            .arg("caddyfile")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(RELOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("{} {} timed out", self.bin, subcommand))?
            .with_context(|| format!("Failed to execute {}", self.bin))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status.success(), stderr))
    }

    /// Put the previous site file back after a failed validate or reload.
    async fn restore_backup(&self, site: &PathBuf, backup: &PathBuf) {
        if backup.exists() {
            if let Err(e) = tokio::fs::copy(backup, site).await {
                warn!("Failed to restore {} from backup: {}", site.display(), e);
            }
        } else if let Err(e) = tokio::fs::remove_file(site).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to drop rejected site file {}: {}", site.display(), e);
            }
        }
    }
}

/// Render one scope's site block. Upstreams are listed in fail-over
/// order: `lb_policy first` keeps traffic on the leading (active) port
/// while its health probe passes.
fn render_site(site: &SiteSpec, log_path: &std::path::Path) -> String {
    let upstreams = site
        .upstreams
        .iter()
        .map(|port| format!("127.0.0.1:{}", port))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"# Managed by bluegreend for {project}/{environment} -- do not edit.
{domain} {{
	encode gzip

	reverse_proxy {upstreams} {{
		lb_policy first
		health_uri /health
		health_interval 10s
		health_timeout 5s
		fail_duration 10s
	}}

	header {{
		X-Project "{project}"
		X-Environment "{environment}"
		X-Slot "{slot}"
		X-Version "{version}"
		-Server
	}}

	log {{
		output file {log_path} {{
			roll_size 10MiB
			roll_keep 5
		}}
	}}
}}
"#,
        project = site.project,
        environment = site.environment,
        domain = site.domain,
        upstreams = upstreams,
        slot = site.active_slot,
        version = site.version,
        log_path = log_path.display(),
    )
}

#[async_trait]
impl ProxyConfigurator for CaddyConfigurator {
    async fn render_and_reload(&self, site: &SiteSpec) -> Result<(), ProxyError> {
        let _guard = self.reload_lock.lock().await;
        self.ensure_layout().await?;

        let path = self.site_path(&site.project, site.environment);
        let backup = path.with_extension("caddy.bak");
        let body = render_site(site, &self.log_path(&site.project, site.environment));

        if path.exists() {
            tokio::fs::copy(&path, &backup)
                .await
                .context("Failed to back up site file")?;
        }

        let tmp = path.with_extension("caddy.tmp");
        tokio::fs::write(&tmp, body.as_bytes())
            .await
            .context("Failed to write site file")?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("Failed to move site file into place")?;

        let (ok, stderr) = self.caddy("validate").await?;
        if !ok {
            warn!("Generated config for {} failed validation: {}", site.domain, stderr);
            self.restore_backup(&path, &backup).await;
            return Err(ProxyError::ConfigInvalid(stderr));
        }

        let (ok, stderr) = self.caddy("reload").await?;
        if !ok {
            warn!("Proxy reload for {} failed: {}", site.domain, stderr);
            self.restore_backup(&path, &backup).await;
            // Bring the proxy back onto the restored file.
            if let Ok((false, e)) = self.caddy("reload").await {
                warn!("Reload of restored configuration also failed: {}", e);
            }
            return Err(ProxyError::ReloadFailed(stderr));
        }

        info!(
            "Proxy now routing {} to upstreams {:?} ({} first)",
            site.domain, site.upstreams, site.active_slot
        );
        Ok(())
    }

    async fn remove_site(
        &self,
        project: &str,
        environment: Environment,
    ) -> Result<(), ProxyError> {
        let _guard = self.reload_lock.lock().await;

        let path = self.site_path(project, environment);
        for file in [&path, &path.with_extension("caddy.bak")] {
            if let Err(e) = tokio::fs::remove_file(file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(ProxyError::Other(
                        anyhow::Error::new(e)
                            .context(format!("Failed to remove {}", file.display())),
                    ));
                }
            }
        }

        let (ok, stderr) = self.caddy("reload").await?;
        if !ok {
            return Err(ProxyError::ReloadFailed(stderr));
        }
        info!("Removed proxy site for {}-{}", project, environment);
        Ok(())
    }
}
