use anyhow::Result;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::application::ports::container_runtime::ContainerRuntime;
use crate::registry::models::{parse_container_name, SlotState};
use crate::registry::store::Registry;

/// What one reconciliation pass changed.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Ports the ledger holds after re-derivation from the scope files.
    pub ledger_ports: usize,
    /// Containers named like a slot whose slot is empty or unknown.
    pub orphans_removed: Vec<String>,
    /// Slots whose container vanished; demoted to deployed.
    pub slots_demoted: Vec<String>,
    /// Scopes re-pushed into the relational mirror.
    pub mirror_repaired: usize,
}

/// Repair divergence between the filesystem of record, the runtime and
/// the relational mirror. Runs at startup and hourly.
///
/// Policy for a live container whose slot is not recorded (crash between
/// proxy reload and registry commit): the slot is marked `deployed`,
/// never `active`, forcing an explicit re-promote.
pub async fn reconcile<R: ContainerRuntime>(
    registry: &Registry,
    runtime: &R,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    // The scope files are the truth for port ownership.
    report.ledger_ports = registry.rebuild_ledger().await?;

    let scopes = registry.list_scopes(None, None).await?;
    let container_names: HashSet<String> = runtime.list_names("").await?.into_iter().collect();

    // Orphans: containers carrying a slot name that nothing owns.
    for name in &container_names {
        let Some((project, environment, slot)) = parse_container_name(name) else {
            continue;
        };
        let owned = scopes
            .iter()
            .find(|s| s.project == project && s.environment == environment)
            .map(|s| !s.slot(slot).is_empty())
            .unwrap_or(false);
        if !owned {
            info!("Removing orphan container {} (slot is empty)", name);
            runtime.stop(name).await.ok();
            runtime.remove(name).await.ok();
            report.orphans_removed.push(name.clone());
        }
    }

    // Non-empty slots whose container the runtime no longer has.
    for scope in &scopes {
        let mut scope = scope.clone();
        let mut changed = false;
        for slot in scope.non_empty_slots() {
            let container = scope.container_name(slot);
            if container_names.contains(&container) {
                continue;
            }
            let record = scope.slot_mut(slot);
            warn!(
                "Container {} missing for {} slot ({}), demoting to deployed",
                container,
                slot,
                record.state
            );
            if record.state != SlotState::Deployed {
                record.state = SlotState::Deployed;
                record.grace_expires_at = None;
            }
            record.container = None;
            if scope.active_slot == Some(slot) {
                scope.active_slot = None;
            }
            report.slots_demoted.push(container);
            changed = true;
        }
        if changed {
            registry.commit_scope(&scope, &[]).await?;
        }
    }

    // Mirror repair: re-push every scope, drop scopes the filesystem no
    // longer has. History rows are left alone.
    if let Some(mirror) = registry.mirror() {
        let scopes = registry.list_scopes(None, None).await?;
        let fs_keys: HashSet<(String, crate::registry::Environment)> = scopes
            .iter()
            .map(|s| (s.project.clone(), s.environment))
            .collect();
        for scope in &scopes {
            if let Err(e) = mirror.upsert_scope(scope).await {
                warn!("Mirror repair of {} failed: {:#}", scope.key(), e);
                continue;
            }
            report.mirror_repaired += 1;
        }
        match mirror.list_scope_keys().await {
            Ok(keys) => {
                for (project, environment) in keys {
                    if !fs_keys.contains(&(project.clone(), environment)) {
                        info!("Dropping stale mirror scope {}-{}", project, environment);
                        if let Err(e) = mirror.delete_scope(&project, environment).await {
                            warn!("Failed to drop mirror scope {}-{}: {:#}", project, environment, e);
                        }
                    }
                }
            }
            Err(e) => warn!("Mirror scope listing failed: {:#}", e),
        }
    }

    Ok(report)
}
