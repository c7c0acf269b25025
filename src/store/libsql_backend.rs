//! libSQL backend: async implementation of the persistence traits.
//!
//! Supports local file and in-memory databases.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::{Account, AccountStatus, normalize_email};
use crate::error::DatabaseError;
use crate::interactions::{Interaction, MessageReceipt};
use crate::store::migrations;
use crate::store::traits::{AccountDirectory, AccountStore, InteractionStore, WriteOutcome};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// but a transaction on it is visible to every caller, so all writes go
/// through `write_lock`.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn load_emails(&self, account_id: Uuid) -> Result<BTreeSet<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT email FROM account_emails WHERE account_id = ?1 ORDER BY email",
                params![account_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_emails: {e}")))?;

        let mut emails = BTreeSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_emails: {e}")))?
        {
            let email: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            emails.insert(email);
        }
        Ok(emails)
    }

    async fn query_interactions(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Interaction>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut interactions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            interactions.push(row_to_interaction(&row)?);
        }
        Ok(interactions)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding. Fixed-width so that text order is time order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Map a libsql Row to an Account (without its addresses).
///
/// Column order matches ACCOUNT_COLUMNS.
fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let id_str: String = row.get(0).map_err(parse_err)?;
    let status_str: String = row.get(2).map_err(parse_err)?;
    let last_str: Option<String> = row.get::<String>(3).ok();
    let created_str: String = row.get(4).map_err(parse_err)?;
    let updated_str: String = row.get(5).map_err(parse_err)?;

    Ok(Account {
        id: parse_uuid(&id_str)?,
        name: row.get(1).map_err(parse_err)?,
        emails: BTreeSet::new(),
        status: status_str
            .parse::<AccountStatus>()
            .map_err(DatabaseError::Serialization)?,
        last_interaction_at: parse_optional_datetime(&last_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        version: row.get(6).map_err(parse_err)?,
    })
}

/// Map a libsql Row to an Interaction.
///
/// Column order matches INTERACTION_COLUMNS.
fn row_to_interaction(row: &libsql::Row) -> Result<Interaction, DatabaseError> {
    let id_str: String = row.get(0).map_err(parse_err)?;
    let account_str: String = row.get(1).map_err(parse_err)?;
    let kind_str: String = row.get(2).map_err(parse_err)?;
    let direction_str: String = row.get(5).map_err(parse_err)?;
    let occurred_str: String = row.get(8).map_err(parse_err)?;
    let auto_generated: i64 = row.get(9).map_err(parse_err)?;
    let created_str: String = row.get(10).map_err(parse_err)?;
    let updated_str: String = row.get(11).map_err(parse_err)?;

    Ok(Interaction {
        id: parse_uuid(&id_str)?,
        account_id: parse_uuid(&account_str)?,
        kind: kind_str.parse().map_err(DatabaseError::Serialization)?,
        message_id: row.get::<String>(3).ok(),
        thread_id: row.get::<String>(4).ok(),
        direction: direction_str.parse().map_err(DatabaseError::Serialization)?,
        title: row.get(6).map_err(parse_err)?,
        summary: row.get(7).map_err(parse_err)?,
        occurred_at: parse_datetime(&occurred_str),
        auto_generated: auto_generated != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        version: row.get(12).map_err(parse_err)?,
    })
}

/// Map a libsql Row to a MessageReceipt.
fn row_to_receipt(row: &libsql::Row) -> Result<MessageReceipt, DatabaseError> {
    let interaction_str: String = row.get(1).map_err(parse_err)?;
    let direction_str: String = row.get(2).map_err(parse_err)?;
    let occurred_str: String = row.get(3).map_err(parse_err)?;
    let recorded_str: String = row.get(4).map_err(parse_err)?;

    Ok(MessageReceipt {
        message_id: row.get(0).map_err(parse_err)?,
        interaction_id: parse_uuid(&interaction_str)?,
        direction: direction_str.parse().map_err(DatabaseError::Serialization)?,
        occurred_at: parse_datetime(&occurred_str),
        recorded_at: parse_datetime(&recorded_str),
    })
}

/// Claim a message id. Zero affected rows means it was already claimed.
async fn insert_receipt(conn: &Connection, receipt: &MessageReceipt) -> Result<u64, DatabaseError> {
    conn.execute(
        "INSERT INTO message_receipts (message_id, interaction_id, direction, occurred_at, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(message_id) DO NOTHING",
        params![
            receipt.message_id.as_str(),
            receipt.interaction_id.to_string(),
            receipt.direction.to_string(),
            fmt_datetime(&receipt.occurred_at),
            fmt_datetime(&receipt.recorded_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_receipt: {e}")))
}

async fn insert_interaction_row(
    conn: &Connection,
    interaction: &Interaction,
) -> Result<u64, DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO interactions ({INTERACTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(message_id) DO NOTHING"
        ),
        params![
            interaction.id.to_string(),
            interaction.account_id.to_string(),
            interaction.kind.to_string(),
            opt_text(interaction.message_id.as_deref()),
            opt_text(interaction.thread_id.as_deref()),
            interaction.direction.to_string(),
            interaction.title.as_str(),
            interaction.summary.as_str(),
            fmt_datetime(&interaction.occurred_at),
            interaction.auto_generated as i64,
            fmt_datetime(&interaction.created_at),
            fmt_datetime(&interaction.updated_at),
            interaction.version,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_interaction: {e}")))
}

async fn update_interaction_row(
    conn: &Connection,
    interaction: &Interaction,
    expected_version: i64,
) -> Result<u64, DatabaseError> {
    conn.execute(
        "UPDATE interactions
         SET direction = ?1, title = ?2, summary = ?3, occurred_at = ?4,
             updated_at = ?5, version = version + 1
         WHERE id = ?6 AND version = ?7",
        params![
            interaction.direction.to_string(),
            interaction.title.as_str(),
            interaction.summary.as_str(),
            fmt_datetime(&interaction.occurred_at),
            fmt_datetime(&interaction.updated_at),
            interaction.id.to_string(),
            expected_version,
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("merge_interaction: {e}")))
}

/// Commit when the write went through, roll back otherwise.
async fn finish(
    tx: libsql::Transaction,
    outcome: Result<WriteOutcome, DatabaseError>,
) -> Result<WriteOutcome, DatabaseError> {
    match outcome {
        Ok(WriteOutcome::Applied) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
            Ok(WriteOutcome::Applied)
        }
        other => {
            if let Err(e) = tx.rollback().await {
                warn!("Rollback failed: {e}");
            }
            other
        }
    }
}

// ── Trait implementations ───────────────────────────────────────────

const ACCOUNT_COLUMNS: &str =
    "id, name, status, last_interaction_at, created_at, updated_at, version";

const JOINED_ACCOUNT_COLUMNS: &str =
    "a.id, a.name, a.status, a.last_interaction_at, a.created_at, a.updated_at, a.version";

const INTERACTION_COLUMNS: &str = "id, account_id, kind, message_id, thread_id, direction, title, summary, occurred_at, auto_generated, created_at, updated_at, version";

const RECEIPT_COLUMNS: &str = "message_id, interaction_id, direction, occurred_at, recorded_at";

#[async_trait]
impl AccountDirectory for LibSqlBackend {
    async fn resolve(
        &self,
        candidate_emails: &BTreeSet<String>,
    ) -> Result<Option<Account>, DatabaseError> {
        let normalized: BTreeSet<String> = candidate_emails
            .iter()
            .map(|e| normalize_email(e))
            .filter(|e| !e.is_empty())
            .collect();

        let mut matches: Vec<Account> = Vec::new();
        for email in &normalized {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {JOINED_ACCOUNT_COLUMNS} FROM accounts a
                         JOIN account_emails e ON e.account_id = a.id
                         WHERE e.email = ?1"
                    ),
                    params![email.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("resolve: {e}")))?;

            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("resolve: {e}")))?
            {
                let account = row_to_account(&row)?;
                if !matches.iter().any(|m| m.id == account.id) {
                    matches.push(account);
                }
            }
        }

        if matches.len() > 1 {
            debug!(
                candidates = matches.len(),
                "Multiple accounts share an address, picking the oldest"
            );
        }

        let winner = matches
            .into_iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        match winner {
            Some(mut account) => {
                account.emails = self.load_emails(account.id).await?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?
        {
            Some(row) => {
                let mut account = row_to_account(&row)?;
                account.emails = self.load_emails(account.id).await?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AccountStore for LibSqlBackend {
    async fn create_account(&self, account: &Account) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        let result: Result<WriteOutcome, DatabaseError> = async {
            tx.execute(
                &format!(
                    "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    account.id.to_string(),
                    account.name.as_str(),
                    account.status.as_str(),
                    opt_text(account.last_interaction_at.map(|t| fmt_datetime(&t)).as_deref()),
                    fmt_datetime(&account.created_at),
                    fmt_datetime(&account.updated_at),
                    account.version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("create_account: {e}")))?;

            for email in &account.emails {
                tx.execute(
                    "INSERT OR IGNORE INTO account_emails (email, account_id) VALUES (?1, ?2)",
                    params![normalize_email(email), account.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("create_account emails: {e}")))?;
            }
            Ok(WriteOutcome::Applied)
        }
        .await;

        finish(tx, result).await?;
        debug!(account_id = %account.id, name = %account.name, "Account created");
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut email_rows = self
            .conn
            .query("SELECT account_id, email FROM account_emails ORDER BY email", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?;

        let mut emails: HashMap<String, BTreeSet<String>> = HashMap::new();
        while let Some(row) = email_rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?
        {
            let account_id: String = row.get(0).map_err(parse_err)?;
            let email: String = row.get(1).map_err(parse_err)?;
            emails.entry(account_id).or_default().insert(email);
        }

        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_accounts: {e}")))?
        {
            let mut account = row_to_account(&row)?;
            account.emails = emails.remove(&account.id.to_string()).unwrap_or_default();
            accounts.push(account);
        }
        Ok(accounts)
    }

    async fn update_account(
        &self,
        account: &Account,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn
            .execute(
                "UPDATE accounts
                 SET status = ?1, last_interaction_at = ?2, updated_at = ?3, version = version + 1
                 WHERE id = ?4 AND version = ?5",
                params![
                    account.status.as_str(),
                    opt_text(account.last_interaction_at.map(|t| fmt_datetime(&t)).as_deref()),
                    fmt_datetime(&Utc::now()),
                    account.id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_account: {e}")))?;

        debug!(
            account_id = %account.id,
            status = %account.status,
            applied = updated > 0,
            "Account update"
        );
        Ok(updated > 0)
    }

    async fn archive_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        let updated = {
            let _guard = self.write_lock.lock().await;
            self.conn
                .execute(
                    "UPDATE accounts SET status = 'archived', updated_at = ?1, version = version + 1
                     WHERE id = ?2",
                    params![fmt_datetime(&Utc::now()), id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("archive_account: {e}")))?
        };

        if updated == 0 {
            return Ok(None);
        }
        info!(account_id = %id, "Account archived");
        self.get_account(id).await
    }
}

#[async_trait]
impl InteractionStore for LibSqlBackend {
    async fn has_message(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM message_receipts WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_message: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_message: {e}")))?;
        Ok(row.is_some())
    }

    async fn find_thread_interaction(
        &self,
        account_id: Uuid,
        thread_id: &str,
    ) -> Result<Option<Interaction>, DatabaseError> {
        let found = self
            .query_interactions(
                &format!(
                    "SELECT {INTERACTION_COLUMNS} FROM interactions
                     WHERE account_id = ?1 AND thread_id = ?2
                     ORDER BY occurred_at DESC, created_at DESC LIMIT 1"
                ),
                params![account_id.to_string(), thread_id],
                "find_thread_interaction",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn get_interaction(&self, id: Uuid) -> Result<Option<Interaction>, DatabaseError> {
        let found = self
            .query_interactions(
                &format!("SELECT {INTERACTION_COLUMNS} FROM interactions WHERE id = ?1"),
                params![id.to_string()],
                "get_interaction",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn insert_interaction(
        &self,
        interaction: &Interaction,
        receipt: &MessageReceipt,
    ) -> Result<WriteOutcome, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        let result: Result<WriteOutcome, DatabaseError> = async {
            if insert_interaction_row(&tx, interaction).await? == 0 {
                return Ok(WriteOutcome::DuplicateMessage);
            }
            if insert_receipt(&tx, receipt).await? == 0 {
                return Ok(WriteOutcome::DuplicateMessage);
            }
            Ok(WriteOutcome::Applied)
        }
        .await;

        let outcome = finish(tx, result).await?;
        debug!(
            interaction_id = %interaction.id,
            message_id = %receipt.message_id,
            outcome = ?outcome,
            "Interaction insert"
        );
        Ok(outcome)
    }

    async fn merge_interaction(
        &self,
        interaction: &Interaction,
        expected_version: i64,
        receipt: &MessageReceipt,
    ) -> Result<WriteOutcome, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        let result: Result<WriteOutcome, DatabaseError> = async {
            if insert_receipt(&tx, receipt).await? == 0 {
                return Ok(WriteOutcome::DuplicateMessage);
            }
            if update_interaction_row(&tx, interaction, expected_version).await? == 0 {
                return Ok(WriteOutcome::VersionConflict);
            }
            Ok(WriteOutcome::Applied)
        }
        .await;

        let outcome = finish(tx, result).await?;
        debug!(
            interaction_id = %interaction.id,
            message_id = %receipt.message_id,
            outcome = ?outcome,
            "Interaction merge"
        );
        Ok(outcome)
    }

    async fn list_interactions(&self, account_id: Uuid) -> Result<Vec<Interaction>, DatabaseError> {
        self.query_interactions(
            &format!(
                "SELECT {INTERACTION_COLUMNS} FROM interactions
                 WHERE account_id = ?1 ORDER BY occurred_at DESC, created_at DESC"
            ),
            params![account_id.to_string()],
            "list_interactions",
        )
        .await
    }

    async fn list_receipts(
        &self,
        interaction_id: Uuid,
    ) -> Result<Vec<MessageReceipt>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RECEIPT_COLUMNS} FROM message_receipts
                     WHERE interaction_id = ?1 ORDER BY occurred_at ASC, recorded_at ASC"
                ),
                params![interaction_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_receipts: {e}")))?;

        let mut receipts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_receipts: {e}")))?
        {
            receipts.push(row_to_receipt(&row)?);
        }
        Ok(receipts)
    }
}
