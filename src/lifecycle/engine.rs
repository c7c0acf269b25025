//! Account lifecycle engine.
//!
//! Status is a pure function of how long an account has been quiet:
//!
//! ```text
//! no interaction yet          → New
//! quiet > inactive_after_days → Inactive
//! quiet > slow_after_days     → Slow
//! otherwise                   → Active
//! ```
//!
//! `Archived` is absorbing and never recomputed. The engine is used inline by
//! the ingestion pipeline (`recompute`) and in batch by the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::notify::NotificationSink;
use crate::accounts::{Account, AccountStatus};
use crate::config::LifecycleThresholds;
use crate::error::DatabaseError;
use crate::store::AccountStore;

/// A persisted status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub account_id: Uuid,
    pub account_name: String,
    pub previous_status: AccountStatus,
    pub new_status: AccountStatus,
    pub last_interaction_at: Option<DateTime<Utc>>,
}

/// An account whose new status could not be persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub account_id: Uuid,
    pub error: String,
}

/// Full result of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub changed: Vec<StatusChange>,
    pub never_contacted: Vec<Account>,
    pub failures: Vec<SweepFailure>,
    /// Accounts modified concurrently (usually by ingestion) and left alone.
    pub skipped: usize,
    /// The sweep stopped early because cancellation was requested.
    pub cancelled: bool,
}

/// Counts exposed to callers of `sweep`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub changed_count: usize,
    pub never_contacted_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub cancelled: bool,
}

impl SweepReport {
    pub fn summary(&self) -> SweepSummary {
        SweepSummary {
            changed_count: self.changed.len(),
            never_contacted_count: self.never_contacted.len(),
            failed_count: self.failures.len(),
            skipped_count: self.skipped,
            cancelled: self.cancelled,
        }
    }
}

/// Cooperative cancellation shared by the engine and its ticker.
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot see a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The lifecycle engine.
pub struct LifecycleEngine {
    thresholds: LifecycleThresholds,
    accounts: Arc<dyn AccountStore>,
    sink: Arc<dyn NotificationSink>,
    cancellation: Cancellation,
}

impl LifecycleEngine {
    pub fn new(
        thresholds: LifecycleThresholds,
        accounts: Arc<dyn AccountStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            thresholds,
            accounts,
            sink,
            cancellation: Cancellation::new(),
        }
    }

    /// Handle used to stop a running sweep between accounts.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Status implied by the last interaction time alone.
    pub fn status_for(
        &self,
        last_interaction_at: Option<DateTime<Utc>>,
        reference_time: DateTime<Utc>,
    ) -> AccountStatus {
        let Some(last) = last_interaction_at else {
            return AccountStatus::New;
        };
        let age_days = reference_time.signed_duration_since(last).num_days();
        if age_days > self.thresholds.inactive_after_days {
            AccountStatus::Inactive
        } else if age_days > self.thresholds.slow_after_days {
            AccountStatus::Slow
        } else {
            AccountStatus::Active
        }
    }

    /// Recompute an account's status at `reference_time`.
    ///
    /// Pure and idempotent: the caller persists the result. Archived accounts
    /// keep their status.
    pub fn recompute(&self, account: &Account, reference_time: DateTime<Utc>) -> AccountStatus {
        if account.is_archived() {
            return AccountStatus::Archived;
        }
        self.status_for(account.last_interaction_at, reference_time)
    }

    /// Load every account and sweep it.
    pub async fn sweep(&self, reference_time: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let accounts = self.accounts.list_accounts().await?;
        Ok(self.sweep_accounts(accounts, reference_time).await)
    }

    /// Recompute and persist the status of each account.
    ///
    /// Never-contacted `New` accounts are collected untouched. A failed write
    /// is recorded and the pass moves on. One notification is sent at the end
    /// if anything changed or any never-contacted account was found.
    pub async fn sweep_accounts(
        &self,
        accounts: Vec<Account>,
        reference_time: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let total = accounts.len();

        for account in accounts {
            if self.cancellation.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if account.is_archived() {
                continue;
            }
            if account.last_interaction_at.is_none() && account.status == AccountStatus::New {
                report.never_contacted.push(account);
                continue;
            }

            let new_status = self.recompute(&account, reference_time);
            if new_status == account.status {
                continue;
            }

            let mut updated = account.clone();
            updated.status = new_status;
            match self.accounts.update_account(&updated, account.version).await {
                Ok(true) => {
                    debug!(
                        account_id = %account.id,
                        from = %account.status,
                        to = %new_status,
                        "Sweep moved account"
                    );
                    report.changed.push(StatusChange {
                        account_id: account.id,
                        account_name: account.name.clone(),
                        previous_status: account.status,
                        new_status,
                        last_interaction_at: account.last_interaction_at,
                    });
                }
                Ok(false) => {
                    debug!(account_id = %account.id, "Account changed during sweep, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Failed to persist sweep status");
                    report.failures.push(SweepFailure {
                        account_id: account.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.changed.is_empty() || !report.never_contacted.is_empty() {
            self.sink.notify(&report.changed, &report.never_contacted);
        }

        info!(
            accounts = total,
            changed = report.changed.len(),
            never_contacted = report.never_contacted.len(),
            failed = report.failures.len(),
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Lifecycle sweep complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Mutex, OnceLock};

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::lifecycle::notify::LifecycleDigest;
    use crate::store::{AccountDirectory, LibSqlBackend};

    #[derive(Default)]
    struct RecordingSink {
        digests: Mutex<Vec<LifecycleDigest>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, changed: &[StatusChange], never_contacted: &[Account]) {
            self.digests
                .lock()
                .unwrap()
                .push(LifecycleDigest::new(changed, never_contacted));
        }
    }

    /// Delegates to a real backend but fails writes for chosen accounts and
    /// can raise cancellation after the first write.
    struct FlakyStore {
        inner: Arc<LibSqlBackend>,
        failing: HashSet<Uuid>,
        cancel_after_write: OnceLock<Cancellation>,
    }

    #[async_trait]
    impl AccountStore for FlakyStore {
        async fn create_account(&self, account: &Account) -> Result<(), DatabaseError> {
            self.inner.create_account(account).await
        }

        async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
            self.inner.list_accounts().await
        }

        async fn update_account(
            &self,
            account: &Account,
            expected_version: i64,
        ) -> Result<bool, DatabaseError> {
            if self.failing.contains(&account.id) {
                return Err(DatabaseError::Query("disk full".into()));
            }
            let applied = self.inner.update_account(account, expected_version).await?;
            if let Some(cancel) = self.cancel_after_write.get() {
                cancel.cancel();
            }
            Ok(applied)
        }

        async fn archive_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
            self.inner.archive_account(id).await
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - Duration::days(days)
    }

    async fn setup() -> (Arc<LibSqlBackend>, Arc<RecordingSink>, LifecycleEngine) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(RecordingSink::default());
        let engine = LifecycleEngine::new(LifecycleThresholds::default(), db.clone(), sink.clone());
        (db, sink, engine)
    }

    fn detached_engine() -> LifecycleEngine {
        struct Unused;
        #[async_trait]
        impl AccountStore for Unused {
            async fn create_account(&self, _: &Account) -> Result<(), DatabaseError> {
                unimplemented!()
            }
            async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
                unimplemented!()
            }
            async fn update_account(&self, _: &Account, _: i64) -> Result<bool, DatabaseError> {
                unimplemented!()
            }
            async fn archive_account(&self, _: Uuid) -> Result<Option<Account>, DatabaseError> {
                unimplemented!()
            }
        }
        LifecycleEngine::new(
            LifecycleThresholds::default(),
            Arc::new(Unused),
            Arc::new(RecordingSink::default()),
        )
    }

    #[test]
    fn threshold_examples() {
        let engine = detached_engine();
        assert_eq!(engine.status_for(Some(days_ago(45)), now()), AccountStatus::Slow);
        assert_eq!(engine.status_for(Some(days_ago(200)), now()), AccountStatus::Inactive);
        assert_eq!(engine.status_for(Some(days_ago(10)), now()), AccountStatus::Active);
        assert_eq!(engine.status_for(None, now()), AccountStatus::New);
    }

    #[test]
    fn threshold_boundaries_are_exclusive() {
        let engine = detached_engine();
        assert_eq!(engine.status_for(Some(days_ago(30)), now()), AccountStatus::Active);
        assert_eq!(engine.status_for(Some(days_ago(31)), now()), AccountStatus::Slow);
        assert_eq!(engine.status_for(Some(days_ago(180)), now()), AccountStatus::Slow);
        assert_eq!(engine.status_for(Some(days_ago(181)), now()), AccountStatus::Inactive);
        // Partial days do not count.
        let almost = now() - Duration::days(31) + Duration::minutes(1);
        assert_eq!(engine.status_for(Some(almost), now()), AccountStatus::Active);
    }

    #[test]
    fn future_last_interaction_is_active() {
        let engine = detached_engine();
        let future = now() + Duration::days(3);
        assert_eq!(engine.status_for(Some(future), now()), AccountStatus::Active);
    }

    #[test]
    fn archived_is_sticky() {
        let engine = detached_engine();
        for age in [0, 45, 200, 5000] {
            let account = Account::new("Gone", ["g@x.com"])
                .with_status(AccountStatus::Archived)
                .with_last_interaction(days_ago(age));
            assert_eq!(engine.recompute(&account, now()), AccountStatus::Archived);
        }
        let never = Account::new("Gone", ["g@x.com"]).with_status(AccountStatus::Archived);
        assert_eq!(engine.recompute(&never, now()), AccountStatus::Archived);
    }

    #[test]
    fn recompute_is_idempotent() {
        let engine = detached_engine();
        let account = Account::new("Acme", ["a@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(60));
        let first = engine.recompute(&account, now());
        let again = engine.recompute(&account.clone().with_status(first), now());
        assert_eq!(first, AccountStatus::Slow);
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn sweep_collects_never_contacted_untouched() {
        let (db, sink, engine) = setup().await;
        let quiet = Account::new("Quiet Co", ["q@x.com"]);
        db.create_account(&quiet).await.unwrap();

        let report = engine.sweep(now()).await.unwrap();
        assert!(report.changed.is_empty());
        assert_eq!(report.never_contacted.len(), 1);
        assert_eq!(report.never_contacted[0].id, quiet.id);

        let stored = db.get_account(quiet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::New);
        assert_eq!(stored.version, 0);

        let digests = sink.digests.lock().unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].never_contacted.len(), 1);
    }

    #[tokio::test]
    async fn sweep_persists_changes_and_notifies_once() {
        let (db, sink, engine) = setup().await;
        let slow = Account::new("Slow Co", ["s@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(45));
        let gone = Account::new("Gone Co", ["g@x.com"])
            .with_status(AccountStatus::Slow)
            .with_last_interaction(days_ago(200));
        let fresh = Account::new("Fresh Co", ["f@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(2));
        let archived = Account::new("Old Co", ["o@x.com"])
            .with_status(AccountStatus::Archived)
            .with_last_interaction(days_ago(900));
        for account in [&slow, &gone, &fresh, &archived] {
            db.create_account(account).await.unwrap();
        }

        let report = engine.sweep(now()).await.unwrap();
        let summary = report.summary();
        assert_eq!(summary.changed_count, 2);
        assert_eq!(summary.never_contacted_count, 0);
        assert_eq!(summary.failed_count, 0);

        assert_eq!(
            db.get_account(slow.id).await.unwrap().unwrap().status,
            AccountStatus::Slow
        );
        assert_eq!(
            db.get_account(gone.id).await.unwrap().unwrap().status,
            AccountStatus::Inactive
        );
        assert_eq!(
            db.get_account(fresh.id).await.unwrap().unwrap().version,
            0
        );
        let old = db.get_account(archived.id).await.unwrap().unwrap();
        assert_eq!(old.status, AccountStatus::Archived);
        assert_eq!(old.version, 0);

        let change = report.changed.iter().find(|c| c.account_id == gone.id).unwrap();
        assert_eq!(change.previous_status, AccountStatus::Slow);
        assert_eq!(change.new_status, AccountStatus::Inactive);
        assert_eq!(change.last_interaction_at, Some(days_ago(200)));

        assert_eq!(sink.digests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_without_news_sends_nothing() {
        let (db, sink, engine) = setup().await;
        let fresh = Account::new("Fresh Co", ["f@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(1));
        db.create_account(&fresh).await.unwrap();

        let report = engine.sweep(now()).await.unwrap();
        assert_eq!(report.summary().changed_count, 0);
        assert!(sink.digests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_demotes_status_without_timestamp_to_new() {
        let (db, _sink, engine) = setup().await;
        let odd = Account::new("Odd Co", ["odd@x.com"]).with_status(AccountStatus::Active);
        db.create_account(&odd).await.unwrap();

        let report = engine.sweep(now()).await.unwrap();
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].new_status, AccountStatus::New);
        assert!(report.never_contacted.is_empty());
    }

    #[tokio::test]
    async fn sweep_continues_past_failing_account() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broken = Account::new("Broken", ["b@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(45))
            .with_created_at(days_ago(400));
        let healthy = Account::new("Healthy", ["h@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(45))
            .with_created_at(days_ago(300));
        db.create_account(&broken).await.unwrap();
        db.create_account(&healthy).await.unwrap();

        let store = Arc::new(FlakyStore {
            inner: db.clone(),
            failing: HashSet::from([broken.id]),
            cancel_after_write: OnceLock::new(),
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = LifecycleEngine::new(LifecycleThresholds::default(), store, sink.clone());

        let report = engine.sweep(now()).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].account_id, broken.id);
        assert!(report.failures[0].error.contains("disk full"));
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].account_id, healthy.id);
        assert_eq!(
            db.get_account(healthy.id).await.unwrap().unwrap().status,
            AccountStatus::Slow
        );
        assert_eq!(sink.digests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_skips_accounts_changed_concurrently() {
        let (db, _sink, engine) = setup().await;
        let account = Account::new("Busy", ["busy@x.com"])
            .with_status(AccountStatus::Active)
            .with_last_interaction(days_ago(45));
        db.create_account(&account).await.unwrap();

        // Snapshot, then let another writer bump the version.
        let snapshot = db.list_accounts().await.unwrap();
        let fresh = account.clone().with_last_interaction(now());
        assert!(db.update_account(&fresh, 0).await.unwrap());

        let report = engine.sweep_accounts(snapshot, now()).await;
        assert_eq!(report.skipped, 1);
        assert!(report.changed.is_empty());
        let stored = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_between_accounts() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for (i, name) in ["First", "Second", "Third"].iter().enumerate() {
            let account = Account::new(*name, [format!("{i}@x.com")])
                .with_status(AccountStatus::Active)
                .with_last_interaction(days_ago(45))
                .with_created_at(days_ago(100 - i as i64));
            db.create_account(&account).await.unwrap();
        }

        let store = Arc::new(FlakyStore {
            inner: db.clone(),
            failing: HashSet::new(),
            cancel_after_write: OnceLock::new(),
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = LifecycleEngine::new(LifecycleThresholds::default(), store.clone(), sink.clone());
        let _ = store.cancel_after_write.set(engine.cancellation());

        let report = engine.sweep(now()).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].account_name, "First");
        // Work done before cancellation is still reported.
        assert_eq!(sink.digests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_resolves_waiters() {
        let cancellation = Cancellation::new();
        let waiter = {
            let c = cancellation.clone();
            tokio::spawn(async move { c.cancelled().await })
        };
        assert!(!cancellation.is_cancelled());
        cancellation.cancel();
        waiter.await.unwrap();
        assert!(cancellation.is_cancelled());
        // Already-cancelled handles resolve immediately.
        cancellation.cancelled().await;
    }
}
