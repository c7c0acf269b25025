//! Notification sinks for lifecycle sweep results.
//!
//! Delivery is fire-and-forget: a sink never reports failure back to the
//! sweep, it logs and drops instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::engine::StatusChange;
use crate::accounts::Account;

/// Receives the outcome of a sweep that changed something or found
/// never-contacted accounts.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, changed: &[StatusChange], never_contacted: &[Account]);
}

/// One sweep's worth of lifecycle news, as an owned message.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleDigest {
    pub changed: Vec<StatusChange>,
    pub never_contacted: Vec<Account>,
    pub created_at: DateTime<Utc>,
}

impl LifecycleDigest {
    pub fn new(changed: &[StatusChange], never_contacted: &[Account]) -> Self {
        Self {
            changed: changed.to_vec(),
            never_contacted: never_contacted.to_vec(),
            created_at: Utc::now(),
        }
    }
}

/// Writes each digest to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, changed: &[StatusChange], never_contacted: &[Account]) {
        for change in changed {
            info!(
                account_id = %change.account_id,
                account = %change.account_name,
                from = %change.previous_status,
                to = %change.new_status,
                "Account status changed"
            );
        }
        if !never_contacted.is_empty() {
            let names: Vec<&str> = never_contacted.iter().map(|a| a.name.as_str()).collect();
            info!(
                count = never_contacted.len(),
                accounts = %names.join(", "),
                "Accounts never contacted"
            );
        }
    }
}

/// Forwards digests into a bounded channel for an outer transport to consume.
pub struct ChannelSink {
    tx: mpsc::Sender<LifecycleDigest>,
}

impl ChannelSink {
    /// Create a sink and the receiver its digests arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LifecycleDigest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, changed: &[StatusChange], never_contacted: &[Account]) {
        let digest = LifecycleDigest::new(changed, never_contacted);
        if let Err(e) = self.tx.try_send(digest) {
            warn!(error = %e, "Dropping lifecycle notification");
        }
    }
}
