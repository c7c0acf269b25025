//! Account data model.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engagement tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Never contacted.
    #[default]
    New,
    Active,
    Slow,
    Inactive,
    /// Manually retired. Lifecycle logic never moves an account out of here.
    Archived,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Slow => "slow",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "active" => Ok(Self::Active),
            "slow" => Ok(Self::Slow),
            "inactive" => Ok(Self::Inactive),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Unknown account status: {}", s)),
        }
    }
}

/// A commercial account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    /// Known addresses, normalized with [`normalize_email`].
    pub emails: BTreeSet<String>,
    pub status: AccountStatus,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every persisted change.
    pub version: i64,
}

impl Account {
    /// Create a fresh `New` account with normalized addresses.
    pub fn new<I, S>(name: impl Into<String>, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            emails: emails
                .into_iter()
                .map(|e| normalize_email(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
            status: AccountStatus::New,
            last_interaction_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Builder: set the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Builder: set the last interaction time.
    pub fn with_last_interaction(mut self, at: DateTime<Utc>) -> Self {
        self.last_interaction_at = Some(at);
        self
    }

    /// Builder: set the status.
    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_archived(&self) -> bool {
        self.status == AccountStatus::Archived
    }
}

static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\s*([^<>\s]+)\s*>").expect("static regex is valid"));

/// Normalize an address for matching: `Name <addr>` → `addr`, trimmed, lowercased.
pub fn normalize_email(raw: &str) -> String {
    let bare = ANGLE_ADDR
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);
    bare.trim().to_lowercase()
}
