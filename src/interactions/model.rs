//! Interaction data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored title length, in characters.
pub const MAX_TITLE_CHARS: usize = 255;

/// Kind of contact recorded. The ingestion pipeline only produces `Email`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Email,
    Call,
    Meeting,
    Note,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Call => write!(f, "call"),
            Self::Meeting => write!(f, "meeting"),
            Self::Note => write!(f, "note"),
        }
    }
}

impl std::str::FromStr for InteractionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "call" => Ok(Self::Call),
            "meeting" => Ok(Self::Meeting),
            "note" => Ok(Self::Note),
            _ => Err(format!("Unknown interaction kind: {}", s)),
        }
    }
}

/// Which way mail flowed relative to the watched mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
    /// A thread that has seen both directions.
    Mixed,
}

impl Direction {
    /// Widen a stored direction with a newly observed one.
    ///
    /// Any disagreement collapses to `Mixed`, and `Mixed` never narrows.
    pub fn merge(self, other: Direction) -> Direction {
        if self == other { self } else { Direction::Mixed }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Self::Incoming),
            "outgoing" => Ok(Self::Outgoing),
            "mixed" => Ok(Self::Mixed),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// A recorded contact event linked to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: InteractionKind,
    /// Message that created this interaction. Unique when present.
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub title: String,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every persisted change.
    pub version: i64,
}

impl Interaction {
    /// Create an auto-generated email interaction.
    pub fn new_email(
        account_id: Uuid,
        message_id: &str,
        thread_id: Option<&str>,
        direction: Direction,
        subject: Option<&str>,
        summary: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind: InteractionKind::Email,
            message_id: Some(message_id.to_string()),
            thread_id: thread_id.map(str::to_string),
            direction,
            title: truncate_title(subject.unwrap_or_default()),
            summary: summary.unwrap_or_default().to_string(),
            occurred_at,
            auto_generated: true,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Fold a follow-up message of the same thread into this interaction.
    ///
    /// Returns the updated copy; `self` is left untouched so a failed
    /// compare-and-swap can retry from a fresh read.
    pub fn merged_with(
        &self,
        direction: Direction,
        subject: Option<&str>,
        summary: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut merged = self.clone();
        merged.direction = self.direction.merge(direction);
        merged.occurred_at = self.occurred_at.max(occurred_at);
        if let Some(summary) = summary.map(str::trim).filter(|s| !s.is_empty()) {
            if merged.summary.is_empty() {
                merged.summary = summary.to_string();
            } else {
                merged.summary.push_str("\n\n[+] ");
                merged.summary.push_str(summary);
            }
        }
        if merged.title.is_empty() {
            merged.title = truncate_title(subject.unwrap_or_default());
        }
        merged.updated_at = Utc::now();
        merged
    }
}

/// Durable record that one message has been ingested.
///
/// Keyed by `message_id`; the primary key is the authoritative idempotency
/// guard. Also keeps each message's own direction, which the interaction's
/// collapsed direction no longer shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub message_id: String,
    pub interaction_id: Uuid,
    pub direction: Direction,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl MessageReceipt {
    pub fn new(
        message_id: &str,
        interaction_id: Uuid,
        direction: Direction,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            interaction_id,
            direction,
            occurred_at,
            recorded_at: Utc::now(),
        }
    }
}

fn truncate_title(subject: &str) -> String {
    subject.trim().chars().take(MAX_TITLE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn base(direction: Direction) -> Interaction {
        Interaction::new_email(
            Uuid::new_v4(),
            "m1",
            Some("t1"),
            direction,
            Some("Quote request"),
            Some("Need 500 pcs"),
            Utc::now(),
        )
    }

    #[test]
    fn direction_merge_widens_to_mixed() {
        assert_eq!(Direction::Incoming.merge(Direction::Incoming), Direction::Incoming);
        assert_eq!(Direction::Incoming.merge(Direction::Outgoing), Direction::Mixed);
        assert_eq!(Direction::Outgoing.merge(Direction::Incoming), Direction::Mixed);
        assert_eq!(Direction::Mixed.merge(Direction::Incoming), Direction::Mixed);
        assert_eq!(Direction::Mixed.merge(Direction::Mixed), Direction::Mixed);
    }

    #[test]
    fn new_email_defaults() {
        let interaction = base(Direction::Incoming);
        assert_eq!(interaction.kind, InteractionKind::Email);
        assert!(interaction.auto_generated);
        assert_eq!(interaction.message_id.as_deref(), Some("m1"));
        assert_eq!(interaction.thread_id.as_deref(), Some("t1"));
        assert_eq!(interaction.title, "Quote request");
        assert_eq!(interaction.version, 0);
    }

    #[test]
    fn title_is_truncated_by_chars() {
        let subject = "é".repeat(300);
        let interaction = Interaction::new_email(
            Uuid::new_v4(),
            "m1",
            None,
            Direction::Outgoing,
            Some(&subject),
            None,
            Utc::now(),
        );
        assert_eq!(interaction.title.chars().count(), MAX_TITLE_CHARS);
        assert!(interaction.summary.is_empty());
    }

    #[test]
    fn merge_takes_latest_time_and_appends_summary() {
        let stored = base(Direction::Incoming);
        let later = stored.occurred_at + Duration::hours(3);
        let merged = stored.merged_with(Direction::Outgoing, None, Some("Sent quote"), later);

        assert_eq!(merged.id, stored.id);
        assert_eq!(merged.direction, Direction::Mixed);
        assert_eq!(merged.occurred_at, later);
        assert_eq!(merged.summary, "Need 500 pcs\n\n[+] Sent quote");
        assert_eq!(merged.message_id, stored.message_id);
    }

    #[test]
    fn merge_never_moves_time_backward() {
        let stored = base(Direction::Incoming);
        let earlier = stored.occurred_at - Duration::days(2);
        let merged = stored.merged_with(Direction::Incoming, None, None, earlier);
        assert_eq!(merged.occurred_at, stored.occurred_at);
        assert_eq!(merged.direction, Direction::Incoming);
        assert_eq!(merged.summary, stored.summary);
    }

    #[test]
    fn merge_fills_empty_title() {
        let mut stored = base(Direction::Incoming);
        stored.title.clear();
        let merged = stored.merged_with(Direction::Incoming, Some("Re: parts"), None, stored.occurred_at);
        assert_eq!(merged.title, "Re: parts");
    }

    #[test]
    fn kind_and_direction_parse() {
        assert_eq!("meeting".parse::<InteractionKind>().unwrap(), InteractionKind::Meeting);
        assert_eq!("mixed".parse::<Direction>().unwrap(), Direction::Mixed);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
