//! Persistence layer: libSQL-backed storage for accounts, interactions and receipts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AccountDirectory, AccountStore, Database, InteractionStore, WriteOutcome};
