//! Replicated-set writes: one identical change applied to every configured
//! site, or to none.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::model::{ReplicatedKey, ReplicatedOp, ReplicatedPayload};
use kestrel_common::types::SiteId;
use kestrel_site::store::{SiteConnector, SiteTransaction};

use crate::recovery::IntentOp;
use crate::two_phase::{TwoPhaseCoordinator, TwoPhasePlan, TwoPhaseReport};

/// Plan applying one replicated mutation at each participant. The whole
/// change stages during prepare; the commit phase only commits.
pub(crate) struct ReplicatedPlan {
    op: ReplicatedOp,
    payload: ReplicatedPayload,
}

#[async_trait]
impl<T: SiteTransaction> TwoPhasePlan<T> for ReplicatedPlan {
    fn label(&self) -> String {
        format!("{} {}", self.op, self.payload.key())
    }

    fn intent(&self) -> IntentOp {
        IntentOp::Replicated {
            key: self.payload.key().to_string(),
        }
    }

    async fn prepare(&self, site: &SiteId, txn: &mut T) -> KestrelResult<()> {
        let key = self.payload.key();
        let exists = txn.replicated_exists(&key).await?;
        match self.op {
            ReplicatedOp::Create => {
                if exists {
                    return Err(KestrelError::PrepareFailed {
                        site: site.clone(),
                        reason: format!("{key} already exists"),
                    });
                }
                txn.insert_replicated(&self.payload).await?;
            }
            ReplicatedOp::Update => {
                if !exists {
                    return Err(KestrelError::PrepareFailed {
                        site: site.clone(),
                        reason: format!("{key} not found"),
                    });
                }
                let changed = txn.update_replicated(&self.payload).await?;
                if changed == 0 {
                    return Err(KestrelError::PrepareFailed {
                        site: site.clone(),
                        reason: format!("{key} not found (lost a concurrent race)"),
                    });
                }
            }
            ReplicatedOp::Delete => {
                if !exists {
                    return Err(KestrelError::PrepareFailed {
                        site: site.clone(),
                        reason: format!("{key} not found"),
                    });
                }
                // A title with copies still on shelves anywhere must not
                // vanish from the catalog; each site vetoes for its own
                // shelf.
                if let ReplicatedKey::Title { isbn } = &key {
                    let held = txn.count_copies_of_title(isbn).await?;
                    if held > 0 {
                        return Err(KestrelError::PrepareFailed {
                            site: site.clone(),
                            reason: format!("{held} copies of {isbn} still held at this site"),
                        });
                    }
                }
                txn.delete_replicated(&key).await?;
            }
        }
        Ok(())
    }
}

/// Applies one replicated write to every configured site, or to none.
///
/// Site enumeration comes from the resolver's directory, in configuration
/// order; payload well-formedness is checked before any remote transaction
/// is opened, so a malformed request never starts partial work anywhere.
pub struct ReplicationSynchronizer<C: SiteConnector> {
    coordinator: Arc<TwoPhaseCoordinator<C>>,
}

impl<C: SiteConnector> ReplicationSynchronizer<C> {
    pub fn new(coordinator: Arc<TwoPhaseCoordinator<C>>) -> Self {
        Self { coordinator }
    }

    pub async fn apply(
        &self,
        op: ReplicatedOp,
        payload: ReplicatedPayload,
    ) -> KestrelResult<TwoPhaseReport> {
        if let Err(reason) = payload.validate_for(op) {
            return Err(KestrelError::InvalidPayload(reason));
        }
        let sites = self.coordinator.resolver().site_ids().to_vec();
        debug!(op = %op, key = %payload.key(), sites = ?sites, "replicated write");
        let plan = ReplicatedPlan { op, payload };
        self.coordinator.execute(&sites, &plan).await
    }
}
