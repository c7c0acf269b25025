//! Commercial accounts: the entities interactions are recorded against.

pub mod model;

pub use model::{Account, AccountStatus, normalize_email};
