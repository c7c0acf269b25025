//! Email ingestion pipeline.
//!
//! Every email event flows through:
//! 1. `EmailEvent::try_from()`: validation of the raw payload
//! 2. `classify()`: direction relative to the watched mailbox
//! 3. `IngestionPipeline::ingest()`: dedup, account resolution, thread
//!    correlation, persistence and lifecycle update
//!
//! **A message id is ingested at most once.** The receipt table is the
//! authority; everything before it is a fast path.

pub mod classifier;
pub mod ingest;
pub mod locks;
pub mod types;

pub use classifier::classify;
pub use ingest::IngestionPipeline;
pub use types::{
    EmailEvent, IngestOutcome, IngestResult, PrecheckOutcome, RawEmailEvent, parse_timestamp,
};
