//! Distributed coordination for the branch-fragmented library database.
//!
//! The library catalog is replicated to every branch site; physical copies,
//! loans and readers are fragmented by branch. This crate coordinates the
//! writes that cross those lines: a two-phase-commit skeleton
//! ([`two_phase::TwoPhaseCoordinator`]) with pluggable operation plans,
//! the copy-transfer and replicated-write operations built on it,
//! fragment-ownership validation, branch-local writes, and the intent
//! journal plus recovery sweep that repair what a torn commit phase
//! leaves behind.

pub mod branch_ops;
pub mod fragmentation;
pub mod recovery;
pub mod replication;
pub mod transfer;
pub mod two_phase;
pub mod txn;

pub use branch_ops::BranchOps;
pub use fragmentation::FragmentedTable;
pub use recovery::{
    IntentLog, IntentOp, IntentOutcome, IntentRecord, MemoryIntentLog, RecoverySweep, SweepReport,
};
pub use replication::ReplicationSynchronizer;
pub use two_phase::{TwoPhaseCoordinator, TwoPhasePlan, TwoPhaseReport};
pub use txn::{DistributedTransaction, Participant, TxnStatus};
