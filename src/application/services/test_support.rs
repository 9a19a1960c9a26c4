//! Hand-written doubles for the port traits, shared by the service tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::application::ports::container_runtime::{
    ContainerRuntime, HealthState, PullError, RunSpec,
};
use crate::application::ports::mirror::{HistoryRow, RegistryMirror};
use crate::application::ports::proxy::{ProxyConfigurator, ProxyError, SiteSpec};
use crate::registry::{Environment, ScopeState};

#[derive(Default)]
pub struct MockRuntime {
    /// Ports the fake runtime reports as published.
    published: Mutex<HashSet<u16>>,
    /// Containers the runtime knows about (running or not).
    known: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    health: Mutex<HashMap<String, HealthState>>,
    probe_results: Mutex<HashMap<String, bool>>,
    /// When set, the next pull fails: (permanent, message).
    pull_failure: Mutex<Option<(bool, String)>>,
    /// Every lifecycle call, in order, e.g. "pull r/acme:v1", "run acme-production-blue".
    pub commands: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_port(&self, port: u16) {
        self.published.lock().unwrap().insert(port);
    }

    pub fn set_health(&self, name: &str, state: HealthState) {
        self.health.lock().unwrap().insert(name.to_string(), state);
    }

    pub fn set_probe_result(&self, name: &str, healthy: bool) {
        self.probe_results.lock().unwrap().insert(name.to_string(), healthy);
    }

    pub fn fail_pull(&self, permanent: bool, message: &str) {
        *self.pull_failure.lock().unwrap() = Some((permanent, message.to_string()));
    }

    pub fn add_container(&self, name: &str, running: bool) {
        self.known.lock().unwrap().insert(name.to_string());
        if running {
            self.running.lock().unwrap().insert(name.to_string());
        }
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.known.lock().unwrap().contains(name)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.commands.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, image: &str) -> Result<(), PullError> {
        self.log(format!("pull {}", image));
        if let Some((permanent, message)) = self.pull_failure.lock().unwrap().take() {
            return Err(if permanent {
                PullError::Permanent(message)
            } else {
                PullError::Transient(message)
            });
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        self.log(format!("run {}", spec.name));
        self.known.lock().unwrap().insert(spec.name.clone());
        self.running.lock().unwrap().insert(spec.name.clone());
        Ok(format!("cid-{}", spec.name))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.log(format!("stop {}", name));
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.log(format!("remove {}", name));
        self.known.lock().unwrap().remove(name);
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn inspect_health(&self, name: &str) -> Result<HealthState> {
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(HealthState::None))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(name))
    }

    async fn probe_http(&self, name: &str, _port: u16, _path: &str) -> Result<bool> {
        Ok(self
            .probe_results
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(false))
    }

    async fn published_host_ports(&self) -> Result<HashSet<u16>> {
        Ok(self.published.lock().unwrap().clone())
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .known
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MockProxy {
    /// Every site spec that was rendered and reloaded, in order.
    pub sites: Mutex<Vec<SiteSpec>>,
    pub removed: Mutex<Vec<String>>,
    fail_next_reload: Mutex<bool>,
}

impl MockProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_reload(&self) {
        *self.fail_next_reload.lock().unwrap() = true;
    }

    pub fn last_site(&self) -> Option<SiteSpec> {
        self.sites.lock().unwrap().last().cloned()
    }

    pub fn reload_count(&self) -> usize {
        self.sites.lock().unwrap().len()
    }
}

#[async_trait]
impl ProxyConfigurator for MockProxy {
    async fn render_and_reload(&self, site: &SiteSpec) -> Result<(), ProxyError> {
        if std::mem::take(&mut *self.fail_next_reload.lock().unwrap()) {
            return Err(ProxyError::ReloadFailed("mock reload failure".into()));
        }
        self.sites.lock().unwrap().push(site.clone());
        Ok(())
    }

    async fn remove_site(
        &self,
        project: &str,
        environment: Environment,
    ) -> Result<(), ProxyError> {
        self.removed
            .lock()
            .unwrap()
            .push(format!("{}-{}", project, environment));
        Ok(())
    }
}

/// Mirror double that records everything it is given.
#[derive(Default)]
pub struct RecordingMirror {
    pub upserts: Mutex<Vec<ScopeState>>,
    pub history: Mutex<Vec<HistoryRow>>,
    pub deleted: Mutex<Vec<String>>,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_log(&self) -> Vec<HistoryRow> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryMirror for RecordingMirror {
    async fn upsert_scope(&self, scope: &ScopeState) -> Result<()> {
        self.upserts.lock().unwrap().push(scope.clone());
        Ok(())
    }

    async fn append_history(&self, row: &HistoryRow) -> Result<()> {
        self.history.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn list_scope_keys(&self) -> Result<Vec<(String, Environment)>> {
        Ok(self
            .upserts
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.project.clone(), s.environment))
            .collect())
    }

    async fn delete_scope(&self, project: &str, environment: Environment) -> Result<()> {
        self.deleted
            .lock()
            .unwrap()
            .push(format!("{}-{}", project, environment));
        Ok(())
    }
}
