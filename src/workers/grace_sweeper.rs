use anyhow::Result;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::application::services::coordinator::CleanupAction;
use crate::state::AppContext;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Grace expiry sweeper.
///
/// Periodically runs an unfiltered, non-forced cleanup so expired grace
/// slots give their containers and ports back without operator action.
/// Failures are logged and the loop keeps running.
pub async fn run_grace_sweeper(context: AppContext) -> Result<()> {
    info!("Starting grace sweeper (runs every 15 minutes)");
    let mut ticker = interval(SWEEP_INTERVAL);

    loop {
        ticker.tick().await;

        match context.coordinator.cleanup(None, None, false, "scheduler").await {
            Ok(report) => {
                let cleaned = report
                    .scopes
                    .iter()
                    .flat_map(|s| &s.slots)
                    .filter(|s| s.action == CleanupAction::Cleaned)
                    .count();
                if cleaned > 0 {
                    info!("Grace sweep reclaimed {} slot(s)", cleaned);
                } else {
                    debug!("Grace sweep found nothing to reclaim");
                }
            }
            Err(e) => warn!("Grace sweep failed: {}", e),
        }
    }
}
