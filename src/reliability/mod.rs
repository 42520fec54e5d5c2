//! Periodic maintenance: failed-queue retry, retention cleanup, SLA scan.
//!
//! One background task fires on a cron schedule and runs the three routines
//! in order. A failing routine is logged and does not stop the others.

pub mod retention;
pub mod retry;
pub mod sla;

pub use retention::RetentionCleanup;
pub use retry::{FailedQueueRetry, RetryReport};
pub use sla::SlaScanner;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ConfigError;

/// Longest uninterrupted sleep, so shutdown is noticed promptly.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Parse a six-field cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "SMARTMAIL_MAINTENANCE_CRON".into(),
        message: format!("invalid cron '{expr}': {e}"),
    })
}

pub struct Maintenance {
    pub retry: FailedQueueRetry,
    pub retention: RetentionCleanup,
    pub sla: SlaScanner,
}

impl Maintenance {
    /// Run every routine once, in order.
    pub async fn run_once(&self) {
        if let Err(e) = self.retry.run().await {
            error!(error = %e, "Failed-queue retry errored");
        }
        if let Err(e) = self.retention.run().await {
            error!(error = %e, "Retention cleanup errored");
        }
        if let Err(e) = self.sla.run().await {
            error!(error = %e, "SLA scan errored");
        }
    }
}

/// Spawn the maintenance loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop the loop.
pub fn spawn_maintenance(
    schedule: Schedule,
    maintenance: Arc<Maintenance>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(schedule = %schedule, "Maintenance scheduler started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Maintenance schedule has no upcoming fire time");
                return;
            };

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Maintenance scheduler shutting down");
                    return;
                }
                let remaining = match (next - Utc::now()).to_std() {
                    Ok(d) if !d.is_zero() => d,
                    _ => break,
                };
                tokio::time::sleep(remaining.min(SHUTDOWN_POLL)).await;
            }

            maintenance.run_once().await;
        }
    });

    (handle, shutdown_flag)
}
