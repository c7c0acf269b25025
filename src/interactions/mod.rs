//! Interaction records and their per-message receipts.

pub mod model;

pub use model::{Direction, Interaction, InteractionKind, MessageReceipt};
