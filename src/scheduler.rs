//! Daily renewal sweep trigger.

use std::sync::Arc;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::renewal::CertificateRenewalOrchestrator;

/// First occurrence of wall-clock time `at` strictly after `now`.
///
/// A day on which `at` does not exist (DST gap) is skipped.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let timezone = now.timezone();
    let mut day = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = timezone
            .from_local_datetime(&day.and_time(at))
            .earliest()
            .filter(|candidate| candidate > now)
        {
            return candidate;
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    now.clone() + chrono::Duration::days(1)
}

/// Runs the sweep every day at `at` local time until `shutdown` fires.
pub async fn run_daily_sweep(
    orchestrator: Arc<CertificateRenewalOrchestrator>,
    at: NaiveTime,
    shutdown: CancellationToken,
) {
    loop {
        let now = Local::now();
        let next = next_run_after(&now, at);
        let wait = (next - now).to_std().unwrap_or_default();
        info!("[scheduler] next renewal sweep at {next}");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("[scheduler] stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let report = orchestrator.renew_all_due(&shutdown).await;
        for failure in &report.failed {
            warn!(
                "[scheduler] {} was not renewed: {}",
                failure.name, failure.error
            );
        }
    }
}
