//! Interaction ingestion pipeline.
//!
//! One event flows through:
//! 1. `EmailEvent::try_from`: validation
//! 2. `classify`: direction relative to the watched mailbox
//! 3. receipt lookup: idempotency fast path
//! 4. `AccountDirectory::resolve`: is this a strategic account?
//! 5. thread correlation: merge into the thread's interaction or create one
//! 6. account touch: `last_interaction_at` and lifecycle status
//!
//! Steps 5 and 6 are each a single guarded write. Uniqueness is enforced by
//! the receipt primary key in storage; the in-process locks only keep
//! concurrent messages of one thread from racing each other into two
//! interactions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::classifier::classify;
use super::locks::KeyedLocks;
use super::types::{EmailEvent, IngestResult, PrecheckOutcome, RawEmailEvent};
use crate::accounts::Account;
use crate::error::{DatabaseError, IngestError};
use crate::interactions::{Direction, Interaction, MessageReceipt};
use crate::lifecycle::LifecycleEngine;
use crate::store::{Database, WriteOutcome};

/// CAS attempts per interaction merge: the first try plus one retry from a fresh read.
const CAS_ATTEMPTS: usize = 2;

/// CAS attempts per account touch. The touch only moves a timestamp forward, so
/// it can be replayed from any fresh read; the interaction before it is already
/// committed and a redelivery of the message would be a duplicate.
const ACCOUNT_TOUCH_ATTEMPTS: usize = 8;

/// How the interaction write for one event ended.
enum Recorded {
    Created(Interaction),
    Merged(Interaction),
    Duplicate,
}

/// Ingests email events into interactions and keeps account lifecycle current.
pub struct IngestionPipeline {
    db: Arc<dyn Database>,
    engine: Arc<LifecycleEngine>,
    thread_locks: KeyedLocks<(Uuid, String)>,
    account_locks: KeyedLocks<Uuid>,
}

impl IngestionPipeline {
    pub fn new(db: Arc<dyn Database>, engine: Arc<LifecycleEngine>) -> Self {
        Self {
            db,
            engine,
            thread_locks: KeyedLocks::new(),
            account_locks: KeyedLocks::new(),
        }
    }

    /// Validate and ingest a raw event.
    ///
    /// Malformed events and events the watched mailbox is not part of come
    /// back as `rejected`, not as errors.
    pub async fn ingest(&self, raw: RawEmailEvent) -> Result<IngestResult, IngestError> {
        let result: Result<IngestResult, IngestError> = async {
            let event = EmailEvent::try_from(raw)?;
            self.process(&event).await
        }
        .await;
        settle(result)
    }

    /// Ingest an already validated event.
    pub async fn ingest_event(&self, event: &EmailEvent) -> Result<IngestResult, IngestError> {
        settle(self.process(event).await)
    }

    async fn process(&self, event: &EmailEvent) -> Result<IngestResult, IngestError> {
        let direction = classify(&event.from, &event.to, &event.cc, &event.watched)?;

        if self.db.has_message(&event.message_id).await? {
            debug!(message_id = %event.message_id, "Message already ingested");
            return Ok(IngestResult::duplicate());
        }

        let Some(account) = self.db.resolve(&event.candidate_emails()).await? else {
            debug!(message_id = %event.message_id, "No strategic account on message");
            return Ok(IngestResult::not_strategic());
        };

        let (interaction, created) = match self.record(&account, event, direction).await? {
            Recorded::Created(interaction) => (interaction, true),
            Recorded::Merged(interaction) => (interaction, false),
            Recorded::Duplicate => {
                debug!(message_id = %event.message_id, "Lost ingest race to a duplicate");
                return Ok(IngestResult::duplicate());
            }
        };

        self.touch_account(account, interaction.occurred_at, event.occurred_at)
            .await?;

        info!(
            message_id = %event.message_id,
            account_id = %interaction.account_id,
            interaction_id = %interaction.id,
            direction = %direction,
            outcome = if created { "created" } else { "updated_existing" },
            "Email ingested"
        );

        Ok(if created {
            IngestResult::created(interaction.account_id, interaction.id)
        } else {
            IngestResult::updated_existing(interaction.account_id, interaction.id)
        })
    }

    /// Merge into the thread's interaction, or create a new one.
    async fn record(
        &self,
        account: &Account,
        event: &EmailEvent,
        direction: Direction,
    ) -> Result<Recorded, IngestError> {
        let Some(thread_id) = event.thread_id.as_deref() else {
            return self.create(account, event, direction).await;
        };

        let _guard = self
            .thread_locks
            .acquire((account.id, thread_id.to_string()))
            .await;

        let mut conflicted = None;
        for attempt in 0..CAS_ATTEMPTS {
            let Some(existing) = self.db.find_thread_interaction(account.id, thread_id).await?
            else {
                return self.create(account, event, direction).await;
            };

            let mut merged = existing.merged_with(
                direction,
                event.subject.as_deref(),
                event.summary.as_deref(),
                event.occurred_at,
            );
            let receipt =
                MessageReceipt::new(&event.message_id, existing.id, direction, event.occurred_at);

            match self
                .db
                .merge_interaction(&merged, existing.version, &receipt)
                .await?
            {
                WriteOutcome::Applied => {
                    merged.version = existing.version + 1;
                    return Ok(Recorded::Merged(merged));
                }
                WriteOutcome::DuplicateMessage => return Ok(Recorded::Duplicate),
                WriteOutcome::VersionConflict => {
                    debug!(interaction_id = %existing.id, attempt, "Interaction changed under merge");
                    conflicted = Some(existing.id);
                }
            }
        }

        let id = conflicted.unwrap_or_default();
        warn!(interaction_id = %id, message_id = %event.message_id, "Giving up on interaction merge");
        Err(IngestError::ConcurrencyConflict {
            entity: "interaction",
            id,
        })
    }

    async fn create(
        &self,
        account: &Account,
        event: &EmailEvent,
        direction: Direction,
    ) -> Result<Recorded, IngestError> {
        let interaction = Interaction::new_email(
            account.id,
            &event.message_id,
            event.thread_id.as_deref(),
            direction,
            event.subject.as_deref(),
            event.summary.as_deref(),
            event.occurred_at,
        );
        let receipt =
            MessageReceipt::new(&event.message_id, interaction.id, direction, event.occurred_at);

        match self.db.insert_interaction(&interaction, &receipt).await? {
            WriteOutcome::Applied => Ok(Recorded::Created(interaction)),
            WriteOutcome::DuplicateMessage => Ok(Recorded::Duplicate),
            WriteOutcome::VersionConflict => Err(IngestError::ConcurrencyConflict {
                entity: "interaction",
                id: interaction.id,
            }),
        }
    }

    /// Advance `last_interaction_at` (never backward) and recompute status.
    ///
    /// A backfilled message that does not advance `last_interaction_at` leaves
    /// the account alone; it says nothing about how recently it was contacted.
    async fn touch_account(
        &self,
        account: Account,
        interaction_at: DateTime<Utc>,
        reference_time: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let _guard = self.account_locks.acquire(account.id).await;
        let account_id = account.id;
        let mut current = account;

        for attempt in 0..ACCOUNT_TOUCH_ATTEMPTS {
            if current
                .last_interaction_at
                .is_some_and(|last| last >= interaction_at)
            {
                debug!(account_id = %account_id, "Message does not advance last contact");
                return Ok(());
            }
            let mut updated = current.clone();
            updated.last_interaction_at = Some(interaction_at);
            updated.status = self.engine.recompute(&updated, reference_time);

            if self.db.update_account(&updated, current.version).await? {
                if updated.status != current.status {
                    info!(
                        account_id = %account_id,
                        from = %current.status,
                        to = %updated.status,
                        "Account status changed on ingest"
                    );
                }
                return Ok(());
            }

            debug!(account_id = %account_id, attempt, "Account changed under update, reloading");
            current = self
                .db
                .get_account(account_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "account".into(),
                    id: account_id.to_string(),
                })?;
        }

        warn!(account_id = %account_id, "Giving up on account update");
        Err(IngestError::ConcurrencyConflict {
            entity: "account",
            id: account_id,
        })
    }

    /// Report what `ingest` would do with this event. Writes nothing.
    pub async fn precheck(&self, raw: RawEmailEvent) -> Result<PrecheckOutcome, IngestError> {
        let event = match EmailEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                return Ok(PrecheckOutcome::Rejected {
                    reason: IngestError::from(e).to_string(),
                });
            }
        };
        let direction = match classify(&event.from, &event.to, &event.cc, &event.watched) {
            Ok(direction) => direction,
            Err(e) => {
                return Ok(PrecheckOutcome::Rejected {
                    reason: IngestError::from(e).to_string(),
                });
            }
        };

        if self.db.has_message(&event.message_id).await? {
            return Ok(PrecheckOutcome::Duplicate);
        }
        let Some(account) = self.db.resolve(&event.candidate_emails()).await? else {
            return Ok(PrecheckOutcome::NotStrategic);
        };

        if let Some(thread_id) = event.thread_id.as_deref() {
            if let Some(existing) = self.db.find_thread_interaction(account.id, thread_id).await? {
                return Ok(PrecheckOutcome::ProcessExisting {
                    account_id: account.id,
                    interaction_id: existing.id,
                    direction,
                });
            }
        }
        Ok(PrecheckOutcome::ProcessNew {
            account_id: account.id,
            direction,
        })
    }
}

/// Turn validation and classification failures into a `rejected` outcome.
fn settle(result: Result<IngestResult, IngestError>) -> Result<IngestResult, IngestError> {
    match result {
        Err(e @ (IngestError::Validation(_) | IngestError::Classification(_))) => {
            info!(reason = %e, "Email rejected");
            Ok(IngestResult::rejected(e.to_string()))
        }
        other => other,
    }
}
