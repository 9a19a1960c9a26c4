use std::sync::Arc;
use tracing::info;

use crate::application::ports::mirror::RegistryMirror;
use crate::application::services::coordinator::{CoordinatorSettings, SlotCoordinator};
use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::infrastructure::database::SqliteMirror;
use crate::infrastructure::proxy::CaddyConfigurator;
use crate::infrastructure::runtime::CliRuntime;
use crate::registry::Registry;

/// The controller assembled: the coordinator is the concrete state
/// machine over the CLI runtime and the Caddy configurator.
pub type Coordinator = SlotCoordinator<CliRuntime, CaddyConfigurator>;

/// Shared application state handed to the API layer and the workers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub runtime: Arc<CliRuntime>,
    pub coordinator: Arc<Coordinator>,
}

impl AppContext {
    /// Wire up all dependencies. A `RegistryCorrupt` error here means the
    /// on-disk state is unusable and the process must not serve traffic.
    pub async fn new(config: Config) -> DeployResult<Self> {
        let mirror: Option<Arc<dyn RegistryMirror>> = match &config.database_url {
            Some(url) => {
                info!("Connecting to mirror database: {}", url);
                let mirror = SqliteMirror::connect(url).await?;
                mirror.migrate().await?;
                Some(Arc::new(mirror))
            }
            None => {
                info!("No DATABASE_URL configured, relational mirroring disabled");
                None
            }
        };

        let registry = Arc::new(Registry::new(&config.registry_root, mirror));
        registry.init().await?;

        let runtime = Arc::new(CliRuntime::new(&config.runtime_bin));
        let proxy = Arc::new(CaddyConfigurator::new(&config.proxy_root, &config.proxy_bin));
        proxy.ensure_layout().await.map_err(DeployError::Internal)?;

        let coordinator = Arc::new(
            SlotCoordinator::new(
                registry.clone(),
                runtime.clone(),
                proxy,
                CoordinatorSettings::from_config(&config),
            )
            .map_err(DeployError::Internal)?,
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            runtime,
            coordinator,
        })
    }
}
