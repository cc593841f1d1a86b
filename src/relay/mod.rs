//! Message relay: trigger, dedup guard, response classifier and dispatch.

pub mod classifier;
pub mod dedup;
pub mod dispatcher;
pub mod trigger;

pub use classifier::{Classification, ClassificationKind, classify, classify_reply};
pub use dedup::DedupGuard;
pub use dispatcher::{recover_unanswered, spawn_dispatcher, spawn_recovery};
pub use trigger::{RelayOutcome, RelayTrigger, SkipReason};
