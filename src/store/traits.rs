//! Persistence collaborators used by the pipeline and the lifecycle engine.
//!
//! Split by concern so that each component only depends on what it touches;
//! [`Database`] bundles all three for wiring.

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::accounts::Account;
use crate::error::DatabaseError;
use crate::interactions::{Interaction, MessageReceipt};

/// Result of a guarded interaction write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Receipt and interaction were both persisted.
    Applied,
    /// A receipt for this message already exists. Nothing was written.
    DuplicateMessage,
    /// The interaction changed since it was read. Nothing was written.
    VersionConflict,
}

/// Read-only lookup of accounts by address.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Resolve a set of addresses to at most one account.
    ///
    /// Addresses are normalized before matching. When several accounts share
    /// an address the oldest account wins, ties broken by lowest id.
    async fn resolve(
        &self,
        candidate_emails: &BTreeSet<String>,
    ) -> Result<Option<Account>, DatabaseError>;

    /// Get an account by ID.
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError>;
}

/// Account persistence.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account with its addresses.
    async fn create_account(&self, account: &Account) -> Result<(), DatabaseError>;

    /// All accounts, oldest first.
    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Persist `status` and `last_interaction_at` if the stored version still
    /// equals `expected_version`. Returns `false` when another writer got there first.
    async fn update_account(
        &self,
        account: &Account,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    /// Move an account to `Archived` unconditionally.
    /// Returns the updated account, or `None` if it does not exist.
    async fn archive_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError>;
}

/// Interaction persistence keyed by message and thread identity.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Whether a receipt exists for this message. Fast path only; the
    /// receipt primary key is what actually enforces uniqueness.
    async fn has_message(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Latest interaction of an account's thread, by `occurred_at`.
    async fn find_thread_interaction(
        &self,
        account_id: Uuid,
        thread_id: &str,
    ) -> Result<Option<Interaction>, DatabaseError>;

    /// Get an interaction by ID.
    async fn get_interaction(&self, id: Uuid) -> Result<Option<Interaction>, DatabaseError>;

    /// Atomically record `receipt` and insert `interaction`.
    async fn insert_interaction(
        &self,
        interaction: &Interaction,
        receipt: &MessageReceipt,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Atomically record `receipt` and overwrite `interaction` if its stored
    /// version still equals `expected_version`.
    async fn merge_interaction(
        &self,
        interaction: &Interaction,
        expected_version: i64,
        receipt: &MessageReceipt,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Interactions of an account, most recent first.
    async fn list_interactions(&self, account_id: Uuid) -> Result<Vec<Interaction>, DatabaseError>;

    /// Receipts folded into an interaction, oldest first.
    async fn list_receipts(&self, interaction_id: Uuid)
    -> Result<Vec<MessageReceipt>, DatabaseError>;
}

/// Every persistence concern in one object.
pub trait Database: AccountDirectory + AccountStore + InteractionStore {}

impl<T> Database for T where T: AccountDirectory + AccountStore + InteractionStore {}
