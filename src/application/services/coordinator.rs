use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::ports::container_runtime::{ContainerRuntime, HealthState, PullError, RunSpec};
use crate::application::ports::mirror::HistoryRow;
use crate::application::ports::proxy::{ProxyConfigurator, ProxyError, SiteSpec};
use crate::application::services::allocator::PortAllocator;
use crate::application::services::prober::{HealthProber, ProbeOutcome, DEFAULT_HEALTH_PATH};
use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::registry::{
    scope_key, Environment, Registry, ScopeState, SlotName, SlotState, GRACE_WINDOW_HOURS,
};
use crate::state::ScopeLocks;

const RESTART_POLICY: &str = "unless-stopped";

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub public_host: String,
    pub base_domain: String,
    pub app_network: String,
    /// Container-internal port replicas listen on unless a deploy
    /// overrides it.
    pub default_app_port: u16,
    pub deploy_probe_deadline: Duration,
    pub gate_probe_deadline: Duration,
    pub lock_wait: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            public_host: config.public_host.clone(),
            base_domain: config.base_domain.clone(),
            app_network: config.app_network.clone(),
            ..Default::default()
        }
    }

    /// Domain a scope is served under. Production scopes get the bare
    /// project subdomain, other environments carry an env suffix.
    pub fn scope_domain(&self, project: &str, environment: Environment) -> String {
        match environment {
            Environment::Production => format!("{}.{}", project, self.base_domain),
            env => format!("{}-{}.{}", project, env, self.base_domain),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            base_domain: "localhost".to_string(),
            app_network: "bluegreen".to_string(),
            default_app_port: 3000,
            deploy_probe_deadline: Duration::from_secs(60),
            gate_probe_deadline: Duration::from_secs(30),
            lock_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Image reference. Omitted means redeploy the scope's last image.
    pub image: Option<String>,
    pub app_port: Option<u16>,
    pub skip_healthcheck: bool,
    pub auto_promote: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub slot: SlotName,
    pub port: u16,
    pub preview_url: String,
    pub is_first_deploy: bool,
    pub active_slot: Option<SlotName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote: Option<PromoteOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraceInfo {
    pub slot: SlotName,
    pub ends_at: DateTime<Utc>,
    pub hours_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteOutcome {
    pub active_slot: SlotName,
    pub previous_slot: Option<SlotName>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace: Option<GraceInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub rolled_back_to: SlotName,
    pub previous_active: Option<SlotName>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAction {
    Cleaned,
    Skipped,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotCleanup {
    pub slot: SlotName,
    pub action: CleanupAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeCleanup {
    pub project: String,
    pub environment: Environment,
    pub slots: Vec<SlotCleanup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub scopes: Vec<ScopeCleanup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatusView {
    pub state: SlotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeStatus {
    pub project: String,
    pub environment: Environment,
    pub active_slot: Option<SlotName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub blue: SlotStatusView,
    pub green: SlotStatusView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSummary {
    pub project: String,
    pub environment: Environment,
    pub active_slot: Option<SlotName>,
    pub blue: SlotState,
    pub green: SlotState,
}

/// The slot state machine: deploy, promote, rollback, cleanup.
///
/// Every transition runs under the scope's lock. Observable side effects
/// are strictly ordered: port allocation, container run, health success,
/// registry write for deploy, proxy reload, registry write for promote.
/// The registry is written only after a proxy reload succeeds, so a
/// reader never sees a promoted slot whose proxy config is not live.
pub struct SlotCoordinator<R, P>
where
    R: ContainerRuntime,
    P: ProxyConfigurator,
{
    registry: Arc<Registry>,
    runtime: Arc<R>,
    proxy: Arc<P>,
    allocator: PortAllocator<R>,
    prober: HealthProber<R>,
    locks: ScopeLocks,
    settings: CoordinatorSettings,
}

impl<R, P> SlotCoordinator<R, P>
where
    R: ContainerRuntime,
    P: ProxyConfigurator,
{
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<R>,
        proxy: Arc<P>,
        settings: CoordinatorSettings,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            allocator: PortAllocator::new(registry.clone(), runtime.clone()),
            prober: HealthProber::new(runtime.clone())?,
            registry,
            runtime,
            proxy,
            locks: ScopeLocks::new(),
            settings,
        })
    }

    async fn lock_scope(
        &self,
        project: &str,
        environment: Environment,
    ) -> DeployResult<tokio::sync::OwnedMutexGuard<()>> {
        let key = scope_key(project, environment);
        self.locks
            .acquire(&key, self.settings.lock_wait)
            .await
            .ok_or(DeployError::ScopeBusy(key))
    }

    pub async fn deploy(
        &self,
        project: &str,
        environment: Environment,
        opts: DeployOptions,
        operator: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<DeployOutcome> {
        let _guard = self.lock_scope(project, environment).await?;
        self.deploy_locked(project, environment, opts, operator, cancel).await
    }

    async fn deploy_locked(
        &self,
        project: &str,
        environment: Environment,
        opts: DeployOptions,
        operator: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<DeployOutcome> {
        if !is_valid_project_name(project) {
            return Err(DeployError::InvalidParams(format!(
                "project name '{}' must be lowercase alphanumeric with dashes",
                project
            )));
        }

        let mut scope = self.registry.load_scope(project, environment).await?;
        let target = scope.deploy_target();
        let is_first_deploy = scope.slots.blue.is_empty() && scope.slots.green.is_empty();

        let image = opts
            .image
            .clone()
            .or_else(|| scope.slot(target).image.clone())
            .or_else(|| {
                scope
                    .active_slot
                    .and_then(|active| scope.slot(active).image.clone())
            })
            .ok_or_else(|| {
                DeployError::InvalidParams("no image given and none previously deployed".into())
            })?;

        let app_port = opts.app_port.unwrap_or(self.settings.default_app_port);
        let port = self.allocator.allocate(project, environment, target).await?;
        let name = scope.container_name(target);

        info!(
            "Deploying {} to {}/{} ({} slot, port {})",
            image, project, environment, target, port
        );

        if let Err(e) = self.runtime.pull(&image).await {
            self.allocator.release(port).await.ok();
            return Err(match e {
                PullError::Permanent(msg) => DeployError::ImageUnavailable(msg),
                PullError::Transient(msg) => {
                    DeployError::ImageUnavailable(format!("pull kept failing: {}", msg))
                }
            });
        }

        // A stale replica may still own the target name after a crashed
        // deploy. Both calls tolerate absence.
        self.runtime.stop(&name).await.ok();
        self.runtime.remove(&name).await.ok();

        let env_file_path = self.registry.env_file_path(project, environment);
        let env_file = tokio::fs::try_exists(&env_file_path)
            .await
            .unwrap_or(false)
            .then_some(env_file_path);
        let env = if env_file.is_none() {
            vec![
                ("NODE_ENV".to_string(), environment.to_string()),
                ("PORT".to_string(), app_port.to_string()),
            ]
        } else {
            Vec::new()
        };

        let health_cmd = (!opts.skip_healthcheck).then(|| {
            format!(
                "curl -fsS -o /dev/null http://localhost:{port}{path} || wget -q -O /dev/null http://localhost:{port}{path}",
                port = app_port,
                path = DEFAULT_HEALTH_PATH,
            )
        });

        let run_spec = RunSpec {
            name: name.clone(),
            image: image.clone(),
            host_port: port,
            container_port: app_port,
            env_file,
            env,
            network: self.settings.app_network.clone(),
            restart_policy: RESTART_POLICY.to_string(),
            health_cmd,
        };

        let container_id = match self.runtime.run(&run_spec).await {
            Ok(id) => id,
            Err(e) => {
                self.runtime.remove(&name).await.ok();
                self.allocator.release(port).await.ok();
                return Err(DeployError::Internal(
                    e.context(format!("Failed to start replica {}", name)),
                ));
            }
        };

        if !opts.skip_healthcheck {
            let outcome = self
                .prober
                .wait_healthy(
                    &name,
                    port,
                    app_port,
                    DEFAULT_HEALTH_PATH,
                    self.settings.deploy_probe_deadline,
                    cancel,
                )
                .await;
            if outcome != ProbeOutcome::Healthy {
                warn!("Replica {} failed its health check, tearing it down", name);
                self.runtime.stop(&name).await.ok();
                self.runtime.remove(&name).await.ok();
                self.allocator.release(port).await.ok();
                return Err(match outcome {
                    ProbeOutcome::Cancelled => {
                        DeployError::Internal(anyhow::anyhow!("deploy cancelled by client"))
                    }
                    _ => DeployError::Unhealthy(format!(
                        "{} never answered on port {}",
                        name, port
                    )),
                });
            }
        }

        let replaced = scope.slot(target).clone();
        let record = scope.slot_mut(target);
        record.state = SlotState::Deployed;
        record.port = Some(port);
        record.app_port = Some(app_port);
        record.container = Some(container_id);
        record.image = Some(image.clone());
        record.deployed_at = Some(Utc::now());
        record.grace_expires_at = None;

        let history = [HistoryRow {
            project: project.to_string(),
            environment,
            slot: target,
            from_state: replaced.state,
            to_state: SlotState::Deployed,
            image: Some(image.clone()),
            port: Some(port),
            operator: operator.to_string(),
            outcome: "deployed".to_string(),
        }];
        self.registry.commit_scope(&scope, &history).await?;

        // The slot no longer references the port of whatever it replaced.
        if let Some(old_port) = replaced.port {
            if old_port != port {
                self.allocator.release(old_port).await.ok();
            }
        }

        let mut outcome = DeployOutcome {
            slot: target,
            port,
            preview_url: format!("http://{}:{}", self.settings.public_host, port),
            is_first_deploy,
            active_slot: scope.active_slot,
            promote: None,
            promote_error: None,
        };

        if opts.auto_promote {
            match self
                .promote_locked(project, environment, Some(target), operator, cancel)
                .await
            {
                Ok(promote) => {
                    outcome.active_slot = Some(promote.active_slot);
                    outcome.promote = Some(promote);
                }
                Err(e) => {
                    warn!("Auto-promote of {}/{} failed: {}", project, environment, e);
                    outcome.promote_error = Some(e.to_string());
                }
            }
        }

        Ok(outcome)
    }

    pub async fn promote(
        &self,
        project: &str,
        environment: Environment,
        target: Option<SlotName>,
        operator: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<PromoteOutcome> {
        let _guard = self.lock_scope(project, environment).await?;
        self.promote_locked(project, environment, target, operator, cancel).await
    }

    async fn promote_locked(
        &self,
        project: &str,
        environment: Environment,
        target: Option<SlotName>,
        operator: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<PromoteOutcome> {
        let mut scope = self.registry.load_scope(project, environment).await?;

        let target = match target {
            Some(slot) => slot,
            None => scope
                .single_slot_in(SlotState::Deployed)
                .ok_or(DeployError::NoPromotableSlot)?,
        };
        let record = scope.slot(target).clone();
        if record.state != SlotState::Deployed {
            return Err(DeployError::NoPromotableSlot);
        }
        let port = record
            .port
            .ok_or_else(|| DeployError::RegistryCorrupt(format!("{} has no port", target)))?;
        let name = scope.container_name(target);

        // Final gate: a slot that stopped answering since its deploy must
        // not take traffic. Neither proxy nor registry is touched on
        // failure.
        self.health_gate(&name, port, record.app_port, cancel, "promote").await?;

        let previous_active = scope.active_slot;
        let mut upstreams = vec![port];
        if let Some(prev) = previous_active {
            if let Some(prev_port) = scope.slot(prev).port {
                upstreams.push(prev_port);
            }
        }

        let domain = self.settings.scope_domain(project, environment);
        let site = SiteSpec {
            project: project.to_string(),
            environment,
            domain: domain.clone(),
            upstreams,
            active_slot: target,
            version: record.image.clone().unwrap_or_default(),
        };
        self.proxy
            .render_and_reload(&site)
            .await
            .map_err(map_proxy_error)?;

        let now = Utc::now();
        let mut history = vec![HistoryRow {
            project: project.to_string(),
            environment,
            slot: target,
            from_state: SlotState::Deployed,
            to_state: SlotState::Active,
            image: record.image.clone(),
            port: Some(port),
            operator: operator.to_string(),
            outcome: "promoted".to_string(),
        }];

        scope.slot_mut(target).state = SlotState::Active;
        scope.slot_mut(target).grace_expires_at = None;

        let mut grace = None;
        if let Some(prev) = previous_active {
            let ends_at = now + chrono::Duration::hours(GRACE_WINDOW_HOURS);
            let prev_record = scope.slot_mut(prev);
            prev_record.state = SlotState::Grace;
            prev_record.grace_expires_at = Some(ends_at);
            history.push(HistoryRow {
                project: project.to_string(),
                environment,
                slot: prev,
                from_state: SlotState::Active,
                to_state: SlotState::Grace,
                image: scope.slot(prev).image.clone(),
                port: scope.slot(prev).port,
                operator: operator.to_string(),
                outcome: "demoted".to_string(),
            });
            grace = Some(GraceInfo {
                slot: prev,
                ends_at,
                hours_remaining: hours_remaining(ends_at, now),
            });
        }
        scope.active_slot = Some(target);
        self.registry.commit_scope(&scope, &history).await?;

        info!(
            "Promoted {}/{}: {} is now active{}",
            project,
            environment,
            target,
            previous_active
                .map(|p| format!(", {} in grace for {}h", p, GRACE_WINDOW_HOURS))
                .unwrap_or_default()
        );

        Ok(PromoteOutcome {
            active_slot: target,
            previous_slot: previous_active,
            url: format!("http://{}", domain),
            grace,
        })
    }

    pub async fn rollback(
        &self,
        project: &str,
        environment: Environment,
        operator: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<RollbackOutcome> {
        let _guard = self.lock_scope(project, environment).await?;
        let mut scope = self.registry.load_scope(project, environment).await?;

        let target = scope
            .single_slot_in(SlotState::Grace)
            .ok_or(DeployError::NothingToRollBack)?;
        let record = scope.slot(target).clone();
        let port = record
            .port
            .ok_or_else(|| DeployError::RegistryCorrupt(format!("{} has no port", target)))?;
        let name = scope.container_name(target);

        if let Err(e) = self.health_gate(&name, port, record.app_port, cancel, "rollback").await {
            return Err(match e {
                DeployError::Unhealthy(msg) => DeployError::GraceUnhealthy(msg),
                other => other,
            });
        }

        let previous_active = scope.active_slot;
        let mut upstreams = vec![port];
        if let Some(prev) = previous_active {
            if let Some(prev_port) = scope.slot(prev).port {
                upstreams.push(prev_port);
            }
        }

        let domain = self.settings.scope_domain(project, environment);
        let site = SiteSpec {
            project: project.to_string(),
            environment,
            domain: domain.clone(),
            upstreams,
            active_slot: target,
            version: record.image.clone().unwrap_or_default(),
        };
        self.proxy
            .render_and_reload(&site)
            .await
            .map_err(map_proxy_error)?;

        let now = Utc::now();
        let mut history = vec![HistoryRow {
            project: project.to_string(),
            environment,
            slot: target,
            from_state: SlotState::Grace,
            to_state: SlotState::Active,
            image: record.image.clone(),
            port: Some(port),
            operator: operator.to_string(),
            outcome: "rolled_back".to_string(),
        }];

        scope.slot_mut(target).state = SlotState::Active;
        scope.slot_mut(target).grace_expires_at = None;

        if let Some(prev) = previous_active {
            // The slot we just took traffic away from gets a fresh timer.
            let ends_at = now + chrono::Duration::hours(GRACE_WINDOW_HOURS);
            let prev_record = scope.slot_mut(prev);
            prev_record.state = SlotState::Grace;
            prev_record.grace_expires_at = Some(ends_at);
            history.push(HistoryRow {
                project: project.to_string(),
                environment,
                slot: prev,
                from_state: SlotState::Active,
                to_state: SlotState::Grace,
                image: scope.slot(prev).image.clone(),
                port: scope.slot(prev).port,
                operator: operator.to_string(),
                outcome: "demoted".to_string(),
            });
        }
        scope.active_slot = Some(target);
        self.registry.commit_scope(&scope, &history).await?;

        info!("Rolled {}/{} back to {}", project, environment, target);

        Ok(RollbackOutcome {
            rolled_back_to: target,
            previous_active,
            url: format!("http://{}", domain),
        })
    }

    /// Reclaim expired grace slots. Scopes are locked one at a time; a
    /// busy scope is reported as skipped rather than waited on forever.
    pub async fn cleanup(
        &self,
        project: Option<&str>,
        environment: Option<Environment>,
        force: bool,
        operator: &str,
    ) -> DeployResult<CleanupReport> {
        let scopes = self.registry.list_scopes(project, environment).await?;
        let mut report = Vec::new();

        for listed in scopes {
            let key = listed.key();
            let guard = self.locks.acquire(&key, self.settings.lock_wait).await;
            if guard.is_none() {
                report.push(ScopeCleanup {
                    project: listed.project.clone(),
                    environment: listed.environment,
                    slots: grace_slots(&listed)
                        .into_iter()
                        .map(|slot| SlotCleanup {
                            slot,
                            action: CleanupAction::Skipped,
                            reason: Some("scope busy".to_string()),
                        })
                        .collect(),
                });
                continue;
            }

            // Re-read under the lock; the listing may be stale.
            let mut scope = self
                .registry
                .load_scope(&listed.project, listed.environment)
                .await?;
            let now = Utc::now();
            let mut slots = Vec::new();

            for slot in grace_slots(&scope) {
                let record = scope.slot(slot).clone();
                let expires = record.grace_expires_at.unwrap_or(now);
                if !force && now < expires {
                    slots.push(SlotCleanup {
                        slot,
                        action: CleanupAction::Skipped,
                        reason: Some(format!("grace until {}", expires.to_rfc3339())),
                    });
                    continue;
                }

                let name = scope.container_name(slot);
                info!("Cleaning up {} ({} grace expired)", name, scope.key());
                self.runtime.stop(&name).await.ok();
                self.runtime.remove(&name).await.ok();
                if let Some(port) = record.port {
                    self.allocator.release(port).await.ok();
                }

                scope.slot_mut(slot).clear();
                let history = [HistoryRow {
                    project: scope.project.clone(),
                    environment: scope.environment,
                    slot,
                    from_state: SlotState::Grace,
                    to_state: SlotState::Empty,
                    image: record.image.clone(),
                    port: record.port,
                    operator: operator.to_string(),
                    outcome: "cleaned".to_string(),
                }];
                self.registry.commit_scope(&scope, &history).await?;
                slots.push(SlotCleanup { slot, action: CleanupAction::Cleaned, reason: None });
            }

            // Nothing left to serve once the last slot is reclaimed; drop
            // the scope's site file so the proxy stops referencing dead
            // upstreams.
            let reclaimed_all = scope.slots.blue.is_empty()
                && scope.slots.green.is_empty()
                && slots.iter().any(|s| s.action == CleanupAction::Cleaned);
            if reclaimed_all {
                if let Err(e) = self.proxy.remove_site(&scope.project, scope.environment).await {
                    warn!("Failed to remove proxy site for {}: {}", scope.key(), e);
                }
            }

            report.push(ScopeCleanup {
                project: scope.project.clone(),
                environment: scope.environment,
                slots,
            });
        }

        Ok(CleanupReport { scopes: report })
    }

    /// Scope state enriched with live runtime information. Read-only and
    /// lock-free: readers never block on a running deploy.
    pub async fn status(
        &self,
        project: &str,
        environment: Environment,
    ) -> DeployResult<ScopeStatus> {
        let scope = self.registry.load_scope(project, environment).await?;
        let (blue, green) = futures::future::join(
            self.slot_view(&scope, SlotName::Blue),
            self.slot_view(&scope, SlotName::Green),
        )
        .await;

        Ok(ScopeStatus {
            project: scope.project.clone(),
            environment: scope.environment,
            active_slot: scope.active_slot,
            url: scope
                .active_slot
                .map(|_| format!("http://{}", self.settings.scope_domain(project, environment))),
            blue,
            green,
        })
    }

    pub async fn list(
        &self,
        project: Option<&str>,
        environment: Option<Environment>,
    ) -> DeployResult<Vec<ScopeSummary>> {
        let scopes = self.registry.list_scopes(project, environment).await?;
        Ok(scopes
            .into_iter()
            .map(|scope| ScopeSummary {
                project: scope.project.clone(),
                environment: scope.environment,
                active_slot: scope.active_slot,
                blue: scope.slots.blue.state,
                green: scope.slots.green.state,
            })
            .collect())
    }

    async fn slot_view(&self, scope: &ScopeState, name: SlotName) -> SlotStatusView {
        let record = scope.slot(name);
        let mut view = SlotStatusView {
            state: record.state,
            port: record.port,
            image: record.image.clone(),
            deployed_at: record.deployed_at,
            grace_expires_at: record.grace_expires_at,
            running: None,
            health: None,
        };
        if !record.is_empty() {
            let container = scope.container_name(name);
            view.running = self.runtime.is_running(&container).await.ok();
            view.health = self
                .runtime
                .inspect_health(&container)
                .await
                .ok()
                .map(health_str);
        }
        view
    }

    async fn health_gate(
        &self,
        name: &str,
        port: u16,
        app_port: Option<u16>,
        cancel: &CancellationToken,
        operation: &str,
    ) -> DeployResult<()> {
        let outcome = self
            .prober
            .wait_healthy(
                name,
                port,
                app_port.unwrap_or(self.settings.default_app_port),
                DEFAULT_HEALTH_PATH,
                self.settings.gate_probe_deadline,
                cancel,
            )
            .await;
        match outcome {
            ProbeOutcome::Healthy => Ok(()),
            ProbeOutcome::Unhealthy => Err(DeployError::Unhealthy(format!(
                "{} failed the {} health gate",
                name, operation
            ))),
            ProbeOutcome::Cancelled => Err(DeployError::Internal(anyhow::anyhow!(
                "{} cancelled by client",
                operation
            ))),
        }
    }
}

fn grace_slots(scope: &ScopeState) -> Vec<SlotName> {
    [SlotName::Blue, SlotName::Green]
        .into_iter()
        .filter(|n| scope.slot(*n).state == SlotState::Grace)
        .collect()
}

fn map_proxy_error(e: ProxyError) -> DeployError {
    match e {
        ProxyError::ConfigInvalid(msg) | ProxyError::ReloadFailed(msg) => {
            DeployError::ProxyReloadFailed(msg)
        }
        ProxyError::Other(e) => DeployError::Internal(e),
    }
}

fn hours_remaining(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    ((ends_at - now).num_minutes() as f64 / 60.0).round() as i64
}

fn health_str(state: HealthState) -> &'static str {
    match state {
        HealthState::Starting => "starting",
        HealthState::Healthy => "healthy",
        HealthState::Unhealthy => "unhealthy",
        HealthState::None => "none",
    }
}

fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::mirror::RegistryMirror;
    use crate::application::services::test_support::{MockProxy, MockRuntime, RecordingMirror};

    struct Harness {
        registry: Arc<Registry>,
        runtime: Arc<MockRuntime>,
        proxy: Arc<MockProxy>,
        mirror: Arc<RecordingMirror>,
        coordinator: SlotCoordinator<MockRuntime, MockProxy>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(RecordingMirror::new());
        let registry = Arc::new(Registry::new(
            dir.path(),
            Some(mirror.clone() as Arc<dyn RegistryMirror>),
        ));
        registry.init().await.unwrap();

        let runtime = Arc::new(MockRuntime::new());
        let proxy = Arc::new(MockProxy::new());
        let settings = CoordinatorSettings {
            public_host: "host.test".into(),
            base_domain: "apps.test".into(),
            // Single probe round per check keeps the tests fast; the mock
            // runtime answers the first signal.
            deploy_probe_deadline: Duration::ZERO,
            gate_probe_deadline: Duration::ZERO,
            ..Default::default()
        };
        let coordinator = SlotCoordinator::new(
            registry.clone(),
            runtime.clone(),
            proxy.clone(),
            settings,
        )
        .unwrap();

        Harness { registry, runtime, proxy, mirror, coordinator, _dir: dir }
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Mark every replica of the scope healthy so probes pass on the
    /// first signal.
    fn make_healthy(h: &Harness, project: &str, env: Environment) {
        for slot in ["blue", "green"] {
            h.runtime
                .set_health(&format!("{}-{}-{}", project, env, slot), HealthState::Healthy);
        }
    }

    async fn deploy(h: &Harness, image: &str) -> DeployOutcome {
        h.coordinator
            .deploy(
                "acme",
                Environment::Production,
                DeployOptions { image: Some(image.into()), ..Default::default() },
                "api",
                &cancel(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_deploy_targets_blue_without_proxy() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);

        let outcome = deploy(&h, "r/acme:v1").await;
        assert_eq!(outcome.slot, SlotName::Blue);
        assert_eq!(outcome.port, 4100);
        assert_eq!(outcome.preview_url, "http://host.test:4100");
        assert!(outcome.is_first_deploy);
        assert_eq!(outcome.active_slot, None);

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.state, SlotState::Deployed);
        assert_eq!(scope.slots.green.state, SlotState::Empty);
        // No traffic cut-over yet.
        assert_eq!(h.proxy.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_promote_first_deploy() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;

        let outcome = h
            .coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        assert_eq!(outcome.active_slot, SlotName::Blue);
        assert_eq!(outcome.previous_slot, None);
        assert_eq!(outcome.url, "http://acme.apps.test");
        assert!(outcome.grace.is_none());

        let site = h.proxy.last_site().unwrap();
        assert_eq!(site.upstreams, vec![4100]);
        assert_eq!(site.domain, "acme.apps.test");

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.state, SlotState::Active);
        assert_eq!(scope.active_slot, Some(SlotName::Blue));
    }

    #[tokio::test]
    async fn test_second_deploy_takes_opposite_slot() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();

        let outcome = deploy(&h, "r/acme:v2").await;
        assert_eq!(outcome.slot, SlotName::Green);
        assert_eq!(outcome.port, 4101);
        assert!(!outcome.is_first_deploy);
        assert_eq!(outcome.active_slot, Some(SlotName::Blue));

        // Blue keeps serving; the proxy was not touched again.
        assert_eq!(h.proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_promote_v2_puts_old_active_in_grace() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        deploy(&h, "r/acme:v2").await;

        let outcome = h
            .coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        assert_eq!(outcome.active_slot, SlotName::Green);
        assert_eq!(outcome.previous_slot, Some(SlotName::Blue));
        let grace = outcome.grace.unwrap();
        assert_eq!(grace.slot, SlotName::Blue);
        assert_eq!(grace.hours_remaining, GRACE_WINDOW_HOURS);

        // New active port first among the upstreams.
        let site = h.proxy.last_site().unwrap();
        assert_eq!(site.upstreams, vec![4101, 4100]);
        assert_eq!(site.active_slot, SlotName::Green);
        assert_eq!(site.version, "r/acme:v2");

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.state, SlotState::Grace);
        assert!(scope.slots.blue.grace_expires_at.is_some());
        assert_eq!(scope.slots.green.state, SlotState::Active);
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_active() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        deploy(&h, "r/acme:v2").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();

        let first_grace = h
            .registry
            .load_scope("acme", Environment::Production)
            .await
            .unwrap()
            .slots
            .blue
            .grace_expires_at
            .unwrap();

        let outcome = h
            .coordinator
            .rollback("acme", Environment::Production, "api", &cancel())
            .await
            .unwrap();
        assert_eq!(outcome.rolled_back_to, SlotName::Blue);
        assert_eq!(outcome.previous_active, Some(SlotName::Green));

        let site = h.proxy.last_site().unwrap();
        assert_eq!(site.upstreams, vec![4100, 4101]);

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.active_slot, Some(SlotName::Blue));
        assert_eq!(scope.slots.blue.state, SlotState::Active);
        assert_eq!(scope.slots.green.state, SlotState::Grace);
        // The demoted slot got a fresh timer, not the old one.
        assert!(scope.slots.green.grace_expires_at.unwrap() >= first_grace);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_expired_grace_slot() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        deploy(&h, "r/acme:v2").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();

        // Not yet expired: the sweep leaves the slot alone.
        let report = h
            .coordinator
            .cleanup(None, None, false, "scheduler")
            .await
            .unwrap();
        assert_eq!(report.scopes[0].slots[0].action, CleanupAction::Skipped);

        // Push the expiry into the past.
        let mut scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        scope.slots.blue.grace_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        h.registry.commit_scope(&scope, &[]).await.unwrap();

        let report = h
            .coordinator
            .cleanup(None, None, false, "scheduler")
            .await
            .unwrap();
        let slot = &report.scopes[0].slots[0];
        assert_eq!(slot.slot, SlotName::Blue);
        assert_eq!(slot.action, CleanupAction::Cleaned);

        assert!(!h.runtime.has_container("acme-production-blue"));
        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.state, SlotState::Empty);
        assert!(!h.registry.ledger_ports().await.unwrap().contains_key(&4100));
    }

    #[tokio::test]
    async fn test_cleanup_force_on_empty_scope_is_noop() {
        let h = harness().await;
        h.registry
            .commit_scope(&ScopeState::new("acme", Environment::Production), &[])
            .await
            .unwrap();

        let report = h.coordinator.cleanup(None, None, true, "api").await.unwrap();
        assert_eq!(report.scopes.len(), 1);
        assert!(report.scopes[0].slots.is_empty());
        assert!(h.proxy.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_of_last_slot_drops_proxy_site() {
        let h = harness().await;

        // Sole survivor is an expired grace slot; its promoted peer was
        // demoted away earlier and the slot never redeployed.
        let mut scope = ScopeState::new("acme", Environment::Production);
        scope.slots.green = crate::registry::SlotRecord {
            state: SlotState::Grace,
            port: Some(4101),
            container: Some("cid-green".into()),
            image: Some("r/acme:v1".into()),
            grace_expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        h.registry.commit_scope(&scope, &[]).await.unwrap();

        let report = h
            .coordinator
            .cleanup(None, None, false, "scheduler")
            .await
            .unwrap();
        assert_eq!(report.scopes[0].slots[0].action, CleanupAction::Cleaned);

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert!(scope.slots.green.is_empty());
        assert!(h
            .proxy
            .removed
            .lock()
            .unwrap()
            .contains(&"acme-production".to_string()));
    }

    #[tokio::test]
    async fn test_pull_failure_releases_port_and_leaves_registry() {
        let h = harness().await;
        h.runtime.fail_pull(true, "manifest unknown");

        let err = h
            .coordinator
            .deploy(
                "acme",
                Environment::Production,
                DeployOptions { image: Some("r/acme:bad".into()), ..Default::default() },
                "api",
                &cancel(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "image_unavailable");

        assert!(h.registry.ledger_ports().await.unwrap().is_empty());
        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert!(scope.slots.blue.is_empty());
        assert_eq!(h.proxy.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_deploy_tears_down_and_releases() {
        let h = harness().await;
        // No health signal at all: every probe round fails.

        let err = h
            .coordinator
            .deploy(
                "acme",
                Environment::Production,
                DeployOptions { image: Some("r/acme:v1".into()), ..Default::default() },
                "api",
                &cancel(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unhealthy");

        assert!(!h.runtime.has_container("acme-production-blue"));
        assert!(h.registry.ledger_ports().await.unwrap().is_empty());
        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert!(scope.slots.blue.is_empty());
    }

    #[tokio::test]
    async fn test_skip_healthcheck_deploys_without_probing() {
        let h = harness().await;

        let outcome = h
            .coordinator
            .deploy(
                "acme",
                Environment::Production,
                DeployOptions {
                    image: Some("r/acme:v1".into()),
                    skip_healthcheck: true,
                    ..Default::default()
                },
                "api",
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.slot, SlotName::Blue);
        assert!(h.runtime.has_container("acme-production-blue"));
    }

    #[tokio::test]
    async fn test_promote_without_deployed_slot_fails() {
        let h = harness().await;
        let err = h
            .coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_promotable_slot");
    }

    #[tokio::test]
    async fn test_proxy_failure_aborts_promote_untouched() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;

        h.proxy.fail_next_reload();
        let err = h
            .coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "proxy_reload_failed");

        // Registry untouched: the slot is still just deployed.
        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.state, SlotState::Deployed);
        assert_eq!(scope.active_slot, None);
    }

    #[tokio::test]
    async fn test_rollback_without_grace_slot_fails() {
        let h = harness().await;
        let err = h
            .coordinator
            .rollback("acme", Environment::Production, "api", &cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "nothing_to_roll_back");
    }

    #[tokio::test]
    async fn test_auto_promote_includes_outcome() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);

        let outcome = h
            .coordinator
            .deploy(
                "acme",
                Environment::Production,
                DeployOptions {
                    image: Some("r/acme:v1".into()),
                    auto_promote: true,
                    ..Default::default()
                },
                "api",
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.active_slot, Some(SlotName::Blue));
        let promote = outcome.promote.unwrap();
        assert_eq!(promote.active_slot, SlotName::Blue);
        assert_eq!(h.proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_deploys_never_share_ports() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);

        let first = deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        let second = deploy(&h, "r/acme:v1").await;

        assert_ne!(first.slot, second.slot);
        assert_ne!(first.port, second.port);
    }

    #[tokio::test]
    async fn test_redeploy_without_image_reuses_last() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v7").await;

        // Image omitted on the second call.
        let outcome = h
            .coordinator
            .deploy("acme", Environment::Production, DeployOptions::default(), "api", &cancel())
            .await
            .unwrap();
        assert_eq!(outcome.slot, SlotName::Blue);

        let scope = h.registry.load_scope("acme", Environment::Production).await.unwrap();
        assert_eq!(scope.slots.blue.image.as_deref(), Some("r/acme:v7"));

        let log = h.runtime.command_log();
        assert_eq!(log.iter().filter(|c| *c == "pull r/acme:v7").count(), 2);
    }

    #[tokio::test]
    async fn test_deploy_without_any_image_is_invalid() {
        let h = harness().await;
        let err = h
            .coordinator
            .deploy("acme", Environment::Production, DeployOptions::default(), "api", &cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[tokio::test]
    async fn test_uppercase_project_name_rejected() {
        let h = harness().await;
        let err = h
            .coordinator
            .deploy(
                "Acme",
                Environment::Production,
                DeployOptions { image: Some("r/acme:v1".into()), ..Default::default() },
                "api",
                &cancel(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[tokio::test]
    async fn test_history_is_appended_per_transition() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();
        deploy(&h, "r/acme:v2").await;
        h.coordinator
            .promote("acme", Environment::Production, None, "api", &cancel())
            .await
            .unwrap();

        let history = h.mirror.history_log();
        let outcomes: Vec<&str> = history.iter().map(|r| r.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["deployed", "promoted", "deployed", "promoted", "demoted"]);
    }

    #[tokio::test]
    async fn test_status_reports_runtime_health() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;

        let status = h.coordinator.status("acme", Environment::Production).await.unwrap();
        assert_eq!(status.blue.state, SlotState::Deployed);
        assert_eq!(status.blue.running, Some(true));
        assert_eq!(status.blue.health, Some("healthy"));
        assert_eq!(status.green.state, SlotState::Empty);
        assert_eq!(status.green.running, None);
        assert!(status.url.is_none());
    }

    #[tokio::test]
    async fn test_list_summarizes_scopes() {
        let h = harness().await;
        make_healthy(&h, "acme", Environment::Production);
        deploy(&h, "r/acme:v1").await;

        let all = h.coordinator.list(None, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].project, "acme");
        assert_eq!(all[0].blue, SlotState::Deployed);

        let none = h.coordinator.list(Some("other"), None).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_hours_remaining_rounds_to_window() {
        let now = Utc::now();
        let ends = now + chrono::Duration::hours(GRACE_WINDOW_HOURS);
        assert_eq!(hours_remaining(ends, now), GRACE_WINDOW_HOURS);
    }

    #[test]
    fn test_project_name_validation() {
        assert!(is_valid_project_name("acme"));
        assert!(is_valid_project_name("my-shop2"));
        assert!(!is_valid_project_name("Acme"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("-acme"));
        assert!(!is_valid_project_name("acme_prod"));
    }
}
