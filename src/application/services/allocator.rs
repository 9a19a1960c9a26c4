use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::application::ports::container_runtime::ContainerRuntime;
use crate::error::{DeployError, DeployResult};
use crate::registry::{Environment, Registry, SlotName};

/// Hands out host ports inside an environment's range.
///
/// A port is considered taken if any of three sources says so: the
/// registry's port ledger, the runtime's published ports, or the OS
/// itself (a TCP bind probe). The ledger can drift after crashes, the
/// runtime holds ports the ledger forgot, and the bind probe catches
/// processes started outside the controller; each source is trusted only
/// for absence.
pub struct PortAllocator<R: ContainerRuntime> {
    registry: Arc<Registry>,
    runtime: Arc<R>,
}

impl<R: ContainerRuntime> PortAllocator<R> {
    pub fn new(registry: Arc<Registry>, runtime: Arc<R>) -> Self {
        Self { registry, runtime }
    }

    /// Return the lowest free port in the environment's range, preferring
    /// the slot's parity (blue even offsets, green odd) and falling back
    /// to the other parity before giving up. The ledger records the port
    /// before it is returned.
    pub async fn allocate(
        &self,
        project: &str,
        environment: Environment,
        slot: SlotName,
    ) -> DeployResult<u16> {
        let ledger: HashSet<u16> = self
            .registry
            .ledger_ports()
            .await?
            .keys()
            .copied()
            .collect();
        let published = self
            .runtime
            .published_host_ports()
            .await
            .map_err(DeployError::Internal)?;

        let range = environment.port_range();
        let preferred = slot.preferred_offset_parity();
        let candidates = range
            .clone()
            .filter(|p| (p - range.start) % 2 == preferred)
            .chain(range.clone().filter(|p| (p - range.start) % 2 != preferred));

        for port in candidates {
            if ledger.contains(&port) || published.contains(&port) {
                continue;
            }
            if !host_port_free(port).await {
                debug!("Port {} is held by a process outside the controller", port);
                continue;
            }

            self.registry.bind_port(port, project, slot).await?;
            info!("Allocated port {} to {}/{} ({})", port, project, environment, slot);
            return Ok(port);
        }

        Err(DeployError::PortsExhausted(environment.to_string()))
    }

    /// Give a port back after a failed deploy or a cleaned-up slot.
    pub async fn release(&self, port: u16) -> DeployResult<()> {
        info!("Releasing port {}", port);
        self.registry.release_port(port).await
    }
}

/// Probe the OS listen table: if the bind fails, something already
/// listens on the port.
async fn host_port_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}
