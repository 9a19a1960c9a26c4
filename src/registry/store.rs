use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::application::ports::mirror::{HistoryRow, RegistryMirror};
use crate::error::{DeployError, DeployResult};
use crate::registry::models::{Environment, PortOwner, ScopeState, SlotName, Ssot};

/// Filesystem-of-record registry with an optional relational mirror.
///
/// All reads come from the filesystem. Writes are atomic (temp file in the
/// same directory, rename, directory fsync) and are pushed to the mirror
/// best-effort afterwards; a mirror failure never fails the caller.
pub struct Registry {
    root: PathBuf,
    mirror: Option<Arc<dyn RegistryMirror>>,
    // Serializes read-modify-write cycles on ssot.json across scopes.
    ssot_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>, mirror: Option<Arc<dyn RegistryMirror>>) -> Self {
        Self {
            root: root.into(),
            mirror,
            ssot_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mirror(&self) -> Option<&Arc<dyn RegistryMirror>> {
        self.mirror.as_ref()
    }

    fn ssot_path(&self) -> PathBuf {
        self.root.join("ssot.json")
    }

    fn slots_dir(&self) -> PathBuf {
        self.root.join("slots")
    }

    fn scope_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.slots_dir().join(format!("{}-{}.json", project, environment))
    }

    /// Env file handed to containers of this scope, when present.
    pub fn env_file_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.root.join("env").join(format!("{}-{}.env", project, environment))
    }

    /// Create the directory layout, seed ssot.json and verify every scope
    /// file loads cleanly. Called once at startup.
    pub async fn init(&self) -> DeployResult<()> {
        tokio::fs::create_dir_all(self.slots_dir())
            .await
            .context("Failed to create slots directory")?;
        tokio::fs::create_dir_all(self.root.join("env"))
            .await
            .context("Failed to create env directory")?;

        if !self.ssot_path().exists() {
            debug!("Seeding {}", self.ssot_path().display());
            self.commit_ssot(&Ssot::default()).await?;
        } else {
            self.load_ssot().await?;
        }

        for scope in self.list_scopes(None, None).await? {
            scope
                .validate()
                .map_err(|e| DeployError::RegistryCorrupt(format!("{}: {}", scope.key(), e)))?;
        }
        Ok(())
    }

    /// Load a scope. A missing file is an empty scope, not an error.
    pub async fn load_scope(
        &self,
        project: &str,
        environment: Environment,
    ) -> DeployResult<ScopeState> {
        let path = self.scope_path(project, environment);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScopeState::new(project, environment));
            }
            Err(e) => {
                return Err(DeployError::Internal(
                    anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
                ));
            }
        };

        let scope: ScopeState = serde_json::from_slice(&bytes).map_err(|e| {
            DeployError::RegistryCorrupt(format!("{}: {}", path.display(), e))
        })?;
        scope
            .validate()
            .map_err(|e| DeployError::RegistryCorrupt(format!("{}: {}", scope.key(), e)))?;
        Ok(scope)
    }

    /// Commit a scope to the filesystem, then mirror it and append the
    /// supplied history rows best-effort.
    pub async fn commit_scope(
        &self,
        scope: &ScopeState,
        history: &[HistoryRow],
    ) -> DeployResult<()> {
        scope
            .validate()
            .map_err(|e| DeployError::RegistryCorrupt(format!("{}: {}", scope.key(), e)))?;

        let path = self.scope_path(&scope.project, scope.environment);
        let bytes = serde_json::to_vec_pretty(scope).context("Failed to serialize scope")?;
        write_atomic(&path, &bytes).await?;

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.upsert_scope(scope).await {
                warn!("Mirror write for {} failed (non-fatal): {:#}", scope.key(), e);
            }
            for row in history {
                if let Err(e) = mirror.append_history(row).await {
                    warn!("History append for {} failed (non-fatal): {:#}", scope.key(), e);
                }
            }
        }
        Ok(())
    }

    /// All scopes on disk, optionally filtered by project and environment.
    pub async fn list_scopes(
        &self,
        project: Option<&str>,
        environment: Option<Environment>,
    ) -> DeployResult<Vec<ScopeState>> {
        let mut scopes = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.slots_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scopes),
            Err(e) => {
                return Err(DeployError::Internal(
                    anyhow::Error::new(e).context("Failed to read slots directory"),
                ));
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to enumerate slots directory")?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let scope: ScopeState = serde_json::from_slice(&bytes).map_err(|e| {
                DeployError::RegistryCorrupt(format!("{}: {}", path.display(), e))
            })?;

            if let Some(p) = project {
                if scope.project != p {
                    continue;
                }
            }
            if let Some(env) = environment {
                if scope.environment != env {
                    continue;
                }
            }
            scopes.push(scope);
        }

        scopes.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(scopes)
    }

    pub async fn load_ssot(&self) -> DeployResult<Ssot> {
        let path = self.ssot_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ssot::default()),
            Err(e) => {
                return Err(DeployError::Internal(
                    anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
                ));
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| DeployError::RegistryCorrupt(format!("{}: {}", path.display(), e)))
    }

    async fn commit_ssot(&self, ssot: &Ssot) -> DeployResult<()> {
        let bytes = serde_json::to_vec_pretty(ssot).context("Failed to serialize ssot")?;
        write_atomic(&self.ssot_path(), &bytes).await?;
        Ok(())
    }

    /// Record a port in the ledger. Held ports survive crashes; they are
    /// released only when their owning slot reaches empty.
    pub async fn bind_port(
        &self,
        port: u16,
        project: &str,
        slot: SlotName,
    ) -> DeployResult<()> {
        let _guard = self.ssot_lock.lock().await;
        let mut ssot = self.load_ssot().await?;
        ssot.ports.insert(
            port,
            PortOwner { project: project.to_string(), slot },
        );
        self.commit_ssot(&ssot).await
    }

    pub async fn release_port(&self, port: u16) -> DeployResult<()> {
        let _guard = self.ssot_lock.lock().await;
        let mut ssot = self.load_ssot().await?;
        if ssot.ports.remove(&port).is_some() {
            self.commit_ssot(&ssot).await?;
        }
        Ok(())
    }

    pub async fn ledger_ports(&self) -> DeployResult<BTreeMap<u16, PortOwner>> {
        Ok(self.load_ssot().await?.ports)
    }

    /// Re-derive the port ledger from the scope files. Used by the
    /// reconciler; the scope files win over whatever the ledger held.
    pub async fn rebuild_ledger(&self) -> DeployResult<usize> {
        let scopes = self.list_scopes(None, None).await?;
        let _guard = self.ssot_lock.lock().await;
        let mut ssot = self.load_ssot().await?;
        ssot.ports.clear();
        for scope in &scopes {
            for name in scope.non_empty_slots() {
                if let Some(port) = scope.slot(name).port {
                    ssot.ports.insert(
                        port,
                        PortOwner { project: scope.project.clone(), slot: name },
                    );
                }
            }
        }
        let count = ssot.ports.len();
        self.commit_ssot(&ssot).await?;
        Ok(count)
    }
}

/// Write-to-temp in the same directory, rename over the target, fsync the
/// directory so the rename itself is durable.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?
        .to_path_buf();
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;

    #[cfg(unix)]
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::File::open(&parent)?.sync_all()
    })
    .await
    .context("Directory fsync task failed")??;

    Ok(())
}
