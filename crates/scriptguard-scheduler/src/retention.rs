//! Retention sweep. Prunes old executions and their logs.

use chrono::{DateTime, Utc};
use scriptguard_core::error::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::history::{ExecutionStore, SweepReport};
use crate::settings::Settings;

/// Delete everything that ended more than `log_retention_days` before `now`.
pub fn sweep_once(history: &ExecutionStore, settings: &Settings, now: DateTime<Utc>) -> Result<SweepReport> {
    let days = settings.log_retention_days();
    let cutoff = now - chrono::Duration::days(days);
    let report = history.sweep(cutoff)?;
    if report.executions > 0 {
        tracing::info!(
            "🧹 Retention sweep: removed {} execution(s), {} log line(s) older than {} days",
            report.executions,
            report.logs,
            days
        );
    } else {
        tracing::debug!("🧹 Retention sweep: nothing older than {days} days");
    }
    Ok(report)
}

/// On-demand cleanup: the retention sweep followed by VACUUM.
pub fn cleanup_now(history: &ExecutionStore, settings: &Settings, now: DateTime<Utc>) -> Result<SweepReport> {
    let report = sweep_once(history, settings, now)?;
    history.vacuum()?;
    tracing::info!("🧹 Database compacted");
    Ok(report)
}

/// Sweep now, then every `interval` until `stop` fires. Failures are logged
/// and the next cycle tries again.
pub fn spawn_retention(
    history: ExecutionStore,
    settings: Settings,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&history, &settings, Utc::now()) {
                        tracing::warn!("⚠️ Retention sweep failed, retrying next cycle: {e}");
                    }
                }
            }
        }
    })
}
