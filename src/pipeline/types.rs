//! Shared types for the ingestion pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::interactions::Direction;

// ── Inbound event ───────────────────────────────────────────────────

/// Email event exactly as a mail collaborator hands it over.
///
/// Every field is optional here; [`EmailEvent::try_from`] decides what is
/// actually required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEmailEvent {
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub from: Option<String>,
    #[serde(default, alias = "to_list")]
    pub to: Vec<String>,
    #[serde(default, alias = "cc_list")]
    pub cc: Vec<String>,
    /// The mailbox being watched on behalf of the business.
    pub watched: Option<String>,
    pub subject: Option<String>,
    pub summary: Option<String>,
    pub occurred_at: Option<String>,
}

/// A validated email event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailEvent {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub watched: String,
    pub subject: Option<String>,
    pub summary: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl EmailEvent {
    /// Every address on the message plus the watched mailbox.
    pub fn candidate_emails(&self) -> BTreeSet<String> {
        std::iter::once(&self.from)
            .chain(std::iter::once(&self.watched))
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .cloned()
            .collect()
    }
}

impl TryFrom<RawEmailEvent> for EmailEvent {
    type Error = ValidationError;

    fn try_from(raw: RawEmailEvent) -> Result<Self, Self::Error> {
        let message_id = required(raw.message_id, "message_id")?;
        let from = required(raw.from, "from")?;
        let watched = required(raw.watched, "watched")?;
        let occurred_raw = required(raw.occurred_at, "occurred_at")?;
        let occurred_at = parse_timestamp("occurred_at", &occurred_raw)?;

        Ok(Self {
            message_id,
            thread_id: non_blank(raw.thread_id),
            from,
            to: raw.to,
            cc: raw.cc,
            watched,
            subject: raw.subject,
            summary: raw.summary,
            occurred_at,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    non_blank(value).ok_or(ValidationError::MissingField(field))
}

/// Naive formats accepted in addition to RFC 3339, read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse an event timestamp.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|ndt| ndt.and_utc())
        .ok_or_else(|| ValidationError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

// ── Outcomes ────────────────────────────────────────────────────────

/// What `ingest` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The message was already ingested. Nothing was written.
    Duplicate,
    /// No known account is on the message. Nothing was written.
    NotStrategic,
    Created,
    UpdatedExisting,
    /// The event was malformed or the watched mailbox is not on it.
    Rejected,
}

/// Result of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub outcome: IngestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IngestResult {
    fn bare(outcome: IngestOutcome) -> Self {
        Self {
            outcome,
            account_id: None,
            interaction_id: None,
            reason: None,
        }
    }

    pub fn duplicate() -> Self {
        Self::bare(IngestOutcome::Duplicate)
    }

    pub fn not_strategic() -> Self {
        Self::bare(IngestOutcome::NotStrategic)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare(IngestOutcome::Rejected)
        }
    }

    pub fn created(account_id: Uuid, interaction_id: Uuid) -> Self {
        Self {
            account_id: Some(account_id),
            interaction_id: Some(interaction_id),
            ..Self::bare(IngestOutcome::Created)
        }
    }

    pub fn updated_existing(account_id: Uuid, interaction_id: Uuid) -> Self {
        Self {
            account_id: Some(account_id),
            interaction_id: Some(interaction_id),
            ..Self::bare(IngestOutcome::UpdatedExisting)
        }
    }
}

/// Dry-run answer: what `ingest` would do with an event right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrecheckOutcome {
    Duplicate,
    NotStrategic,
    Rejected {
        reason: String,
    },
    ProcessExisting {
        account_id: Uuid,
        interaction_id: Uuid,
        direction: Direction,
    },
    ProcessNew {
        account_id: Uuid,
        direction: Direction,
    },
}
