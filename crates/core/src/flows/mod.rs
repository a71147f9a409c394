pub mod backoff;
pub mod policy;

pub use backoff::BackoffPolicy;
pub use policy::{rule_for, rule_for_flow, StageAdvance, StageOutcome, StageReport, StageRule, STAGE_TABLE};
