//! Point-to-point transfer of one copy row between sites.
//!
//! The participant order is `[destination, source]` and the commit phase
//! runs in that order: the destination inserts and commits before the
//! source deletes and commits. An interruption between the two local
//! commits therefore leaves a duplicate, which the journal and the
//! recovery sweep can detect and correct; the reverse order could lose the
//! record outright, which nothing downstream could repair.

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::model::{BookCopy, CopyStatus};
use kestrel_common::types::SiteId;
use kestrel_site::store::{SiteConnector, SiteTransaction};

use crate::fragmentation::{self, FragmentedTable};
use crate::recovery::IntentOp;
use crate::two_phase::{TwoPhaseCoordinator, TwoPhasePlan, TwoPhaseReport};

/// Plan for moving one copy row from `from` to `to`.
pub(crate) struct TransferPlan {
    copy_id: String,
    from: SiteId,
    to: SiteId,
    /// Row snapshot taken by the source prepare, consumed by the
    /// destination's commit-side insert.
    snapshot: Mutex<Option<BookCopy>>,
}

impl TransferPlan {
    fn new(copy_id: &str, from: &SiteId, to: &SiteId) -> Self {
        Self {
            copy_id: copy_id.to_string(),
            from: from.clone(),
            to: to.clone(),
            snapshot: Mutex::new(None),
        }
    }

    /// Source prepare: the copy must still exist and still be
    /// transferable. The tentative `in_transit` mark stays uncommitted
    /// until the commit phase decides.
    async fn prepare_source<T: SiteTransaction>(&self, txn: &mut T) -> KestrelResult<()> {
        let copy = txn.book_copy(&self.copy_id).await?.ok_or_else(|| {
            KestrelError::PrepareFailed {
                site: self.from.clone(),
                reason: format!("copy {} not found", self.copy_id),
            }
        })?;
        if copy.status != CopyStatus::Available {
            return Err(KestrelError::PrepareFailed {
                site: self.from.clone(),
                reason: format!(
                    "copy {} not available for transfer (status {})",
                    self.copy_id, copy.status
                ),
            });
        }
        let changed = txn
            .update_copy_status(&self.copy_id, CopyStatus::Available, CopyStatus::InTransit)
            .await?;
        if changed == 0 {
            return Err(KestrelError::PrepareFailed {
                site: self.from.clone(),
                reason: format!(
                    "copy {} not available for transfer (lost a concurrent race)",
                    self.copy_id
                ),
            });
        }
        *self.snapshot.lock() = Some(copy);
        Ok(())
    }

    /// Destination prepare: the copy id must not already exist there.
    async fn prepare_destination<T: SiteTransaction>(&self, txn: &mut T) -> KestrelResult<()> {
        if txn.book_copy(&self.copy_id).await?.is_some() {
            return Err(KestrelError::PrepareFailed {
                site: self.to.clone(),
                reason: format!("copy {} already present at destination", self.copy_id),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> KestrelResult<BookCopy> {
        self.snapshot.lock().clone().ok_or_else(|| {
            KestrelError::Internal(format!(
                "transfer of {}: source prepare left no row snapshot",
                self.copy_id
            ))
        })
    }

    async fn insert_at_destination<T: SiteTransaction>(&self, txn: &mut T) -> KestrelResult<()> {
        let moved = BookCopy {
            branch_id: self.to.as_str().to_string(),
            status: CopyStatus::Available,
            ..self.snapshot()?
        };
        fragmentation::validate(FragmentedTable::Copies, &moved.branch_id, &self.to)?;
        txn.insert_copy(&moved).await?;
        Ok(())
    }

    async fn delete_at_source<T: SiteTransaction>(&self, txn: &mut T) -> KestrelResult<()> {
        let snapshot = self.snapshot()?;
        fragmentation::validate(FragmentedTable::Copies, &snapshot.branch_id, &self.from)?;
        let removed = txn.delete_copy(&self.copy_id).await?;
        if removed == 0 {
            return Err(KestrelError::Internal(format!(
                "copy {} vanished from {} between prepare and commit",
                self.copy_id, self.from
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: SiteTransaction> TwoPhasePlan<T> for TransferPlan {
    fn label(&self) -> String {
        format!("transfer {} from {} to {}", self.copy_id, self.from, self.to)
    }

    fn intent(&self) -> IntentOp {
        IntentOp::TransferCopy {
            copy_id: self.copy_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
        }
    }

    async fn prepare(&self, site: &SiteId, txn: &mut T) -> KestrelResult<()> {
        if *site == self.from {
            self.prepare_source(txn).await
        } else {
            self.prepare_destination(txn).await
        }
    }

    async fn apply(&self, site: &SiteId, txn: &mut T) -> KestrelResult<()> {
        if *site == self.to {
            self.insert_at_destination(txn).await
        } else {
            self.delete_at_source(txn).await
        }
    }
}

impl<C: SiteConnector> TwoPhaseCoordinator<C> {
    /// Move one copy row between two sites via two-phase commit.
    ///
    /// Prepare re-checks at the source that the copy exists and is
    /// `available`, marks it `in_transit` without committing and snapshots
    /// the row; the destination checks the id is absent. The commit phase
    /// inserts at the destination and commits it, then deletes at the
    /// source and commits that, in that order.
    pub async fn transfer_copy(
        &self,
        copy_id: &str,
        from: &SiteId,
        to: &SiteId,
    ) -> KestrelResult<TwoPhaseReport> {
        if copy_id.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "transfer names no copy id".to_string(),
            ));
        }
        if from == to {
            return Err(KestrelError::InvalidPayload(format!(
                "transfer of {copy_id}: source and destination are both {from}"
            )));
        }
        let plan = TransferPlan::new(copy_id, from, to);
        self.execute(&[to.clone(), from.clone()], &plan).await
    }
}
