//! Cron-driven background sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::LifecycleEngine;

/// Spawn a task that runs a sweep at each fire time of `schedule`.
///
/// The task exits when the engine's cancellation is triggered, including
/// while it is waiting for the next fire time.
pub fn spawn_sweep_ticker(engine: Arc<LifecycleEngine>, schedule: cron::Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancellation = engine.cancellation();
        info!(schedule = %schedule, "Lifecycle sweep ticker started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Sweep schedule has no upcoming fire times, stopping ticker");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Lifecycle sweep ticker shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match engine.sweep(Utc::now()).await {
                Ok(report) => {
                    let summary = report.summary();
                    info!(
                        changed = summary.changed_count,
                        never_contacted = summary.never_contacted_count,
                        failed = summary.failed_count,
                        "Scheduled sweep finished"
                    );
                    if summary.cancelled {
                        return;
                    }
                }
                Err(e) => error!(error = %e, "Scheduled sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;
    use crate::config::LifecycleThresholds;
    use crate::lifecycle::TracingSink;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn ticker_stops_on_cancel() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = Arc::new(LifecycleEngine::new(
            LifecycleThresholds::default(),
            db,
            Arc::new(TracingSink),
        ));
        // Yearly: the ticker will be parked in its wait.
        let schedule = cron::Schedule::from_str("0 0 0 1 1 *").unwrap();
        let handle = spawn_sweep_ticker(engine.clone(), schedule);

        engine.cancellation().cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ticker should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn ticker_runs_sweeps_on_schedule() {
        use crate::accounts::{Account, AccountStatus};
        use crate::store::{AccountDirectory, AccountStore};

        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let stale = Account::new("Stale", ["s@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(Utc::now() - chrono::Duration::days(90));
        db.create_account(&stale).await.unwrap();

        let engine = Arc::new(LifecycleEngine::new(
            LifecycleThresholds::default(),
            db.clone(),
            Arc::new(TracingSink),
        ));
        let schedule = cron::Schedule::from_str("* * * * * *").unwrap();
        let handle = spawn_sweep_ticker(engine.clone(), schedule);

        let mut status = AccountStatus::Active;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = db.get_account(stale.id).await.unwrap().unwrap().status;
            if status == AccountStatus::Slow {
                break;
            }
        }
        engine.cancellation().cancel();
        handle.await.unwrap();
        assert_eq!(status, AccountStatus::Slow);
    }
}
