//! Distributed-transaction bookkeeping: the status machine, per-site
//! participants and the in-memory transaction record.

use std::fmt;

use kestrel_common::error::KestrelError;
use kestrel_common::types::{SiteId, TxnId};

/// Overall status of a distributed transaction.
///
/// Statuses only move forward: `Preparing -> Prepared -> Committing ->
/// Committed` on success, diverging to `Aborting -> Aborted` on any failure
/// before `Committed`. Backward and skipping moves are rejected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TxnStatus::Preparing => "PREPARING",
            TxnStatus::Prepared => "PREPARED",
            TxnStatus::Committing => "COMMITTING",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::Aborting => "ABORTING",
            TxnStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }

    /// The legal forward edges of the status machine.
    pub fn can_advance_to(self, next: TxnStatus) -> bool {
        use TxnStatus::*;
        matches!(
            (self, next),
            (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Preparing, Aborting)
                | (Prepared, Aborting)
                | (Committing, Aborting)
                | (Aborting, Aborted)
        )
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One site's handle in a distributed transaction: its open local
/// transaction plus one-way phase flags. Each flag is set at most once,
/// and the flags stay mutually consistent: committing requires prepared,
/// and the two terminal flags exclude each other.
pub struct Participant<T> {
    site: SiteId,
    txn: Option<T>,
    prepared: bool,
    committed: bool,
    aborted: bool,
}

impl<T> Participant<T> {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            txn: None,
            prepared: false,
            committed: false,
            aborted: false,
        }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn prepared(&self) -> bool {
        self.prepared
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Hand the participant its open local transaction.
    pub fn attach(&mut self, txn: T) {
        self.txn = Some(txn);
    }

    pub fn txn_mut(&mut self) -> Option<&mut T> {
        self.txn.as_mut()
    }

    /// Take the local transaction out for commit or rollback.
    pub fn take_txn(&mut self) -> Option<T> {
        self.txn.take()
    }

    pub fn has_txn(&self) -> bool {
        self.txn.is_some()
    }

    pub fn mark_prepared(&mut self, txn_id: TxnId) -> Result<(), KestrelError> {
        if self.prepared || self.committed || self.aborted {
            return Err(KestrelError::FlagAlreadySet {
                txn: txn_id,
                site: self.site.clone(),
                flag: "prepared",
            });
        }
        self.prepared = true;
        Ok(())
    }

    pub fn mark_committed(&mut self, txn_id: TxnId) -> Result<(), KestrelError> {
        if !self.prepared || self.committed || self.aborted {
            return Err(KestrelError::FlagAlreadySet {
                txn: txn_id,
                site: self.site.clone(),
                flag: "committed",
            });
        }
        self.committed = true;
        Ok(())
    }

    /// Abort does not require a prior prepare: a participant whose prepare
    /// never finished is still rolled back.
    pub fn mark_aborted(&mut self, txn_id: TxnId) -> Result<(), KestrelError> {
        if self.committed || self.aborted {
            return Err(KestrelError::FlagAlreadySet {
                txn: txn_id,
                site: self.site.clone(),
                flag: "aborted",
            });
        }
        self.aborted = true;
        Ok(())
    }
}

/// In-memory record of one coordinated operation.
///
/// Participants keep their insertion order; that order is the commit and
/// abort order. The id is correlation-only and is never persisted into any
/// site database.
pub struct DistributedTransaction<T> {
    id: TxnId,
    participants: Vec<Participant<T>>,
    status: TxnStatus,
}

impl<T> DistributedTransaction<T> {
    pub fn new(id: TxnId, sites: impl IntoIterator<Item = SiteId>) -> Self {
        Self {
            id,
            participants: sites.into_iter().map(Participant::new).collect(),
            status: TxnStatus::Preparing,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn participants(&self) -> &[Participant<T>] {
        &self.participants
    }

    pub fn participants_mut(&mut self) -> &mut [Participant<T>] {
        &mut self.participants
    }

    pub fn participant_mut(&mut self, site: &SiteId) -> Option<&mut Participant<T>> {
        self.participants.iter_mut().find(|p| p.site() == site)
    }

    /// Advance the status machine, rejecting illegal moves.
    pub fn advance(&mut self, next: TxnStatus) -> Result<(), KestrelError> {
        if !self.status.can_advance_to(next) {
            return Err(KestrelError::IllegalTransition {
                txn: self.id,
                from: self.status.name(),
                to: next.name(),
            });
        }
        self.status = next;
        Ok(())
    }
}
