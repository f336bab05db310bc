//! Workflows run against provisioned clusters.
//!
//! Each operation creates or changes something and then reads the cluster
//! back to confirm the outcome, returning `Ok(())` only when the observed
//! behavior matches what the cluster's role requires.

pub mod group;
pub mod journal_delay;
pub mod snap_clone;
pub mod snap_schedule;

pub use group::{GroupWorkflow, DEFAULT_POOL};
pub use journal_delay::{configure_mirroring_delay, verify_mirroring_delay, DelayScope};
pub use snap_clone::{CloneOps, SnapCloneWorkflow, SnapOp};
pub use snap_schedule::verify_snapshot_schedule;
