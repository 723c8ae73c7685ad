pub mod activity;
pub mod dedup;
pub mod ledger;
pub mod retention;
pub mod tiers;

pub use activity::{ActivityLog, ActivityRecord, ActivityType};
pub use dedup::{DedupConfig, DedupDecision, DedupKey, DedupStrategy, GiftDeduplicator};
pub use ledger::{AccumulationLedger, GiftApplied, LedgerEntry};
pub use retention::{RetentionConfig, RetentionSweeper, SweepReport};
pub use tiers::{classify, Tier, TierAssignment, TierConfig, TierMember};
