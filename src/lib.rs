//! CRM intake: email interaction ingestion and account lifecycle.

pub mod accounts;
pub mod api;
pub mod config;
pub mod error;
pub mod interactions;
pub mod lifecycle;
pub mod pipeline;
pub mod store;
