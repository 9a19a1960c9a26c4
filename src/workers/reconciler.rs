use anyhow::Result;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::registry::reconciler::reconcile;
use crate::state::AppContext;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Drift repair worker. The first tick fires immediately, so a pass runs
/// at startup and hourly thereafter.
pub async fn run_reconciler(context: AppContext) -> Result<()> {
    info!("Starting reconciler (runs hourly)");
    let mut ticker = interval(RECONCILE_INTERVAL);

    loop {
        ticker.tick().await;

        match reconcile(&context.registry, &*context.runtime).await {
            Ok(report) => {
                if !report.orphans_removed.is_empty() || !report.slots_demoted.is_empty() {
                    info!(
                        "Reconcile: {} ledger ports, removed {:?}, demoted {:?}",
                        report.ledger_ports, report.orphans_removed, report.slots_demoted
                    );
                } else {
                    info!(
                        "Reconcile: {} ledger ports, no drift",
                        report.ledger_ports
                    );
                }
            }
            Err(e) => warn!("Reconciliation failed: {:#}", e),
        }
    }
}
