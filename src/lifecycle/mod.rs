//! Account lifecycle: status derivation, batch sweeps and their notifications.

pub mod engine;
pub mod notify;
pub mod sweeper;

pub use engine::{
    Cancellation, LifecycleEngine, StatusChange, SweepFailure, SweepReport, SweepSummary,
};
pub use notify::{ChannelSink, LifecycleDigest, NotificationSink, TracingSink};
pub use sweeper::spawn_sweep_ticker;
