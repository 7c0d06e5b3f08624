//! Error taxonomy for the kestrel coordination layer.
//!
//! Every fallible path in the workspace funnels into [`KestrelError`].
//! Callers decide how to react through [`KestrelError::kind`]:
//!
//! - [`ErrorKind::UserError`] — a precondition or input failed; nothing was
//!   committed anywhere and the request itself is wrong or stale.
//! - [`ErrorKind::Transient`] — an unreachable site, a timeout, lock
//!   contention; the whole operation rolled back and may be retried.
//! - [`ErrorKind::Inconsistency`] — a commit-phase failure left sites
//!   diverged; it must surface loudly and must never be retried blindly.
//! - [`ErrorKind::InternalBug`] — a protocol invariant broke; a bug in this
//!   workspace, not in the request.

use thiserror::Error;
use tracing::warn;

use crate::types::{SiteId, TxnId};

pub type KestrelResult<T> = Result<T, KestrelError>;

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    Inconsistency,
    InternalBug,
}

/// Top-level error for every coordination operation.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Fragmentation(#[from] FragmentationViolation),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A prepare-phase precondition failed. Every participant rolled back;
    /// no site kept any change.
    #[error("prepare failed at {site}: {reason}")]
    PrepareFailed { site: SiteId, reason: String },

    /// A commit-phase call failed after prepare succeeded. Sites in
    /// `committed` retain the change; `site` is where the failure hit and
    /// `rolled_back` lists participants that were still open and were
    /// rolled back. An empty `committed` list means the outcome is a clean
    /// rollback despite the commit-phase failure.
    #[error(
        "commit failed at {site} during {txn}: {reason} (committed: {committed:?}, rolled back: {rolled_back:?})"
    )]
    CommitFailed {
        txn: TxnId,
        site: SiteId,
        reason: String,
        committed: Vec<SiteId>,
        rolled_back: Vec<SiteId>,
    },

    /// Malformed request payload; rejected before any transaction opened.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Backward or skipping move attempted on the transaction status
    /// machine.
    #[error("illegal status transition {from} -> {to} in {txn}")]
    IllegalTransition {
        txn: TxnId,
        from: &'static str,
        to: &'static str,
    },

    /// A participant phase flag was set twice, or set after a conflicting
    /// terminal flag.
    #[error("participant {site} in {txn}: {flag} flag set twice or after a terminal flag")]
    FlagAlreadySet {
        txn: TxnId,
        site: SiteId,
        flag: &'static str,
    },

    /// A phase exceeded its configured budget at one site.
    #[error("{phase} timed out after {ms}ms at {site}")]
    PhaseTimeout {
        site: SiteId,
        phase: &'static str,
        ms: u64,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures dialing or probing a site connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Site id absent from the configured directory. Nothing was dialed.
    #[error("unknown site {0}")]
    UnknownSite(SiteId),

    /// All probe attempts exhausted.
    #[error("site {site} unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        site: SiteId,
        attempts: u32,
        reason: String,
    },

    #[error("connect to {site} timed out after {ms}ms")]
    ConnectTimeout { site: SiteId, ms: u64 },

    #[error("driver error at {site}: {reason}")]
    Driver { site: SiteId, reason: String },
}

/// Site-local statement failures surfaced by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row write-locked by a concurrent local transaction.
    #[error("row {key} is locked by a concurrent transaction")]
    RowBusy { key: String },

    #[error("duplicate key {key}")]
    DuplicateKey { key: String },

    #[error("statement failed: {0}")]
    Statement(String),

    /// Use of a local transaction after commit or rollback.
    #[error("transaction already closed")]
    TxnClosed,
}

/// A fragmented write named a row whose fragment key belongs to a
/// different site. Raised before any transaction is opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "fragmentation violation: {table}.{column} = '{value}' does not match owning site {expected}"
)]
pub struct FragmentationViolation {
    pub table: &'static str,
    pub column: &'static str,
    pub value: String,
    pub expected: SiteId,
}

impl KestrelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::PrepareFailed { .. }
            | KestrelError::InvalidPayload(_)
            | KestrelError::Fragmentation(_) => ErrorKind::UserError,

            KestrelError::Connection(ConnectionError::UnknownSite(_)) => ErrorKind::UserError,
            KestrelError::Connection(_) => ErrorKind::Transient,

            KestrelError::Store(StoreError::RowBusy { .. })
            | KestrelError::Store(StoreError::Statement(_)) => ErrorKind::Transient,
            KestrelError::Store(StoreError::DuplicateKey { .. }) => ErrorKind::UserError,
            KestrelError::Store(StoreError::TxnClosed) => ErrorKind::InternalBug,

            KestrelError::PhaseTimeout { .. } => ErrorKind::Transient,

            // A commit-phase failure with nothing committed is a clean
            // rollback; with a non-empty committed list the sites diverged.
            KestrelError::CommitFailed { committed, .. } => {
                if committed.is_empty() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Inconsistency
                }
            }

            KestrelError::IllegalTransition { .. }
            | KestrelError::FlagAlreadySet { .. }
            | KestrelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::UserError
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_inconsistency(&self) -> bool {
        self.kind() == ErrorKind::Inconsistency
    }

    pub fn is_internal_bug(&self) -> bool {
        self.kind() == ErrorKind::InternalBug
    }

    /// Sites known to have committed, for reconciliation tooling. Empty for
    /// every variant except a partial [`KestrelError::CommitFailed`].
    pub fn committed_sites(&self) -> &[SiteId] {
        match self {
            KestrelError::CommitFailed { committed, .. } => committed,
            _ => &[],
        }
    }

    /// Prepend operation context to the message, keeping the classification
    /// of the underlying variant where it matters.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            KestrelError::PrepareFailed { site, reason } => KestrelError::PrepareFailed {
                site,
                reason: format!("{context}: {reason}"),
            },
            KestrelError::InvalidPayload(reason) => {
                KestrelError::InvalidPayload(format!("{context}: {reason}"))
            }
            KestrelError::Internal(reason) => {
                KestrelError::Internal(format!("{context}: {reason}"))
            }
            KestrelError::Store(StoreError::Statement(reason)) => {
                KestrelError::Store(StoreError::Statement(format!("{context}: {reason}")))
            }
            other => other,
        }
    }

    /// Emit the structured warning for a commit-phase divergence. Commit
    /// failures are warning-grade and must be distinguishable from prepare
    /// failures in logs; this is the single place that formats them.
    pub fn log_if_inconsistent(&self) {
        if let KestrelError::CommitFailed {
            txn,
            site,
            reason,
            committed,
            rolled_back,
        } = self
        {
            if !committed.is_empty() {
                warn!(
                    txn = %txn,
                    failed_site = %site,
                    committed = ?committed,
                    rolled_back = ?rolled_back,
                    reason = %reason,
                    "commit phase diverged; sites need reconciliation"
                );
            }
        }
    }
}

/// Extension adding context to any result convertible into [`KestrelError`].
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> KestrelResult<T>;
    fn ctx_with(self, context: impl FnOnce() -> String) -> KestrelResult<T>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> KestrelResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn ctx_with(self, context: impl FnOnce() -> String) -> KestrelResult<T> {
        self.map_err(|e| e.into().with_context(&context()))
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    fn site(id: &str) -> SiteId {
        SiteId::new(id)
    }

    // ── user errors ──

    #[test]
    fn test_prepare_failure_is_user_error() {
        let err = KestrelError::PrepareFailed {
            site: site("Q1"),
            reason: "copy QS001 not available for transfer".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UserError);
        assert!(err.is_user_error());
        assert!(err.committed_sites().is_empty());
    }

    #[test]
    fn test_fragmentation_violation_is_user_error() {
        let err: KestrelError = FragmentationViolation {
            table: "copies",
            column: "branch_id",
            value: "Q3".to_string(),
            expected: site("Q1"),
        }
        .into();
        assert!(err.is_user_error());
        let msg = err.to_string();
        assert!(msg.contains("copies.branch_id"), "message was: {msg}");
        assert!(msg.contains("Q1"), "message was: {msg}");
    }

    #[test]
    fn test_unknown_site_is_user_error_but_unreachable_is_transient() {
        let unknown: KestrelError = ConnectionError::UnknownSite(site("Q9")).into();
        assert!(unknown.is_user_error());

        let unreachable: KestrelError = ConnectionError::Unreachable {
            site: site("Q3"),
            attempts: 3,
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(unreachable.is_transient());
    }

    // ── transient errors ──

    #[test]
    fn test_row_busy_and_timeout_are_transient() {
        let busy: KestrelError = StoreError::RowBusy {
            key: "copies/QS001".to_string(),
        }
        .into();
        assert!(busy.is_transient());

        let timeout = KestrelError::PhaseTimeout {
            site: site("Q3"),
            phase: "prepare",
            ms: 5000,
        };
        assert!(timeout.is_transient());
    }

    // ── commit failures ──

    #[test]
    fn test_commit_failure_with_nothing_committed_is_transient() {
        let err = KestrelError::CommitFailed {
            txn: TxnId(7),
            site: site("Q3"),
            reason: "statement failed".to_string(),
            committed: vec![],
            rolled_back: vec![site("Q1"), site("Q3")],
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_partial_commit_failure_is_inconsistency() {
        let err = KestrelError::CommitFailed {
            txn: TxnId(7),
            site: site("Q1"),
            reason: "connection reset".to_string(),
            committed: vec![site("Q3")],
            rolled_back: vec![],
        };
        assert!(err.is_inconsistency());
        assert_eq!(err.committed_sites(), &[site("Q3")]);
        let msg = err.to_string();
        assert!(msg.contains("commit failed"), "message was: {msg}");
        assert!(msg.contains("txn:7"), "message was: {msg}");
    }

    // ── internal bugs ──

    #[test]
    fn test_machine_violations_are_internal_bugs() {
        let transition = KestrelError::IllegalTransition {
            txn: TxnId(1),
            from: "COMMITTED",
            to: "ABORTING",
        };
        assert!(transition.is_internal_bug());

        let flag = KestrelError::FlagAlreadySet {
            txn: TxnId(1),
            site: site("Q1"),
            flag: "prepared",
        };
        assert!(flag.is_internal_bug());

        let closed: KestrelError = StoreError::TxnClosed.into();
        assert!(closed.is_internal_bug());
    }

    // ── context ──

    #[test]
    fn test_with_context_keeps_classification() {
        let err = KestrelError::PrepareFailed {
            site: site("Q1"),
            reason: "copy QS001 not found".to_string(),
        }
        .with_context("transfer QS001");
        assert!(err.is_user_error());
        assert!(err.to_string().contains("transfer QS001: copy QS001 not found"));
    }

    #[test]
    fn test_ctx_on_results() {
        let r: Result<(), StoreError> = Err(StoreError::Statement("boom".to_string()));
        let err = r.ctx("seeding Q1").unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("seeding Q1: boom"));
    }
}
