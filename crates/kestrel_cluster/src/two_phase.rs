//! The two-phase-commit protocol skeleton.
//!
//! [`TwoPhaseCoordinator::execute`] drives one [`DistributedTransaction`]
//! across an ordered participant list; the per-operation behavior plugs in
//! as a [`TwoPhasePlan`]. Phase rules:
//!
//! - Prepare fans out concurrently, one future per participant, and fans
//!   in before the status advances. Any failure, a connection error
//!   included, aborts every participant; nothing stays committed.
//! - The commit phase is sequential in participant order: first the
//!   commit-side writes, then each local commit. Operations choose their
//!   participant order to bias what an interruption leaves behind, so this
//!   order is load-bearing and deterministic.
//! - Abort fans out concurrently; rollback order has no observable effect.
//!
//! A failure between local commits leaves sites diverged. That surfaces as
//! [`KestrelError::CommitFailed`] naming the sites that kept the change,
//! is logged at warning grade distinctly from prepare failures, and is
//! never silently retried; the journal and the recovery sweep take over
//! from there.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use kestrel_common::config::CoordinatorConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::types::{SiteId, TxnId};
use kestrel_site::resolver::ConnectionResolver;
use kestrel_site::store::{SiteConnection, SiteConnector, SiteTransaction, TxnOf};

use crate::recovery::{IntentLog, IntentOp, IntentOutcome, MemoryIntentLog, RecoverySweep};
use crate::txn::{DistributedTransaction, TxnStatus};

/// Per-operation behavior plugged into the protocol skeleton.
#[async_trait]
pub trait TwoPhasePlan<T: SiteTransaction>: Send + Sync {
    /// Short operation label for logs and journal entries.
    fn label(&self) -> String;

    /// What this operation is about to change, for the intent journal.
    fn intent(&self) -> IntentOp;

    /// Prepare-side checks and tentative writes inside one participant's
    /// local transaction. Runs concurrently across participants.
    async fn prepare(&self, site: &SiteId, txn: &mut T) -> KestrelResult<()>;

    /// Commit-side writes inside one participant's still-open local
    /// transaction. Runs sequentially in participant order, before any
    /// local commit. Defaults to nothing: most operations stage their
    /// whole change during prepare.
    async fn apply(&self, _site: &SiteId, _txn: &mut T) -> KestrelResult<()> {
        Ok(())
    }
}

/// Outcome of one committed distributed operation.
#[derive(Debug, Clone)]
pub struct TwoPhaseReport {
    pub txn_id: TxnId,
    /// Participants in commit order.
    pub sites: Vec<SiteId>,
    pub prepare_latency_us: u64,
    pub commit_latency_us: u64,
}

/// Drives distributed transactions over resolved site connections.
pub struct TwoPhaseCoordinator<C: SiteConnector> {
    resolver: Arc<ConnectionResolver<C>>,
    config: CoordinatorConfig,
    intents: Arc<dyn IntentLog>,
    txn_seq: AtomicU64,
}

impl<C: SiteConnector> TwoPhaseCoordinator<C> {
    pub fn new(resolver: Arc<ConnectionResolver<C>>, config: CoordinatorConfig) -> Self {
        Self::with_intent_log(resolver, config, Arc::new(MemoryIntentLog::new()))
    }

    pub fn with_intent_log(
        resolver: Arc<ConnectionResolver<C>>,
        config: CoordinatorConfig,
        intents: Arc<dyn IntentLog>,
    ) -> Self {
        // Seed the sequence from the clock so ids from successive processes
        // do not collide in logs; they carry no other meaning.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            resolver,
            config,
            intents,
            txn_seq: AtomicU64::new(seed),
        }
    }

    pub fn resolver(&self) -> &Arc<ConnectionResolver<C>> {
        &self.resolver
    }

    pub fn intent_log(&self) -> Arc<dyn IntentLog> {
        self.intents.clone()
    }

    /// A recovery sweep sharing this coordinator's resolver, journal and
    /// configured repair budget.
    pub fn recovery_sweep(&self) -> RecoverySweep<C> {
        RecoverySweep::new(
            self.resolver.clone(),
            self.intents.clone(),
            self.config.sweep_max_repairs,
        )
    }

    fn next_txn_id(&self) -> TxnId {
        TxnId(self.txn_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Run one distributed operation. `sites` is the participant list in
    /// commit order.
    pub async fn execute<P>(&self, sites: &[SiteId], plan: &P) -> KestrelResult<TwoPhaseReport>
    where
        P: TwoPhasePlan<TxnOf<C>>,
    {
        if sites.is_empty() {
            return Err(KestrelError::InvalidPayload(
                "operation names no participant sites".to_string(),
            ));
        }
        for (i, site) in sites.iter().enumerate() {
            if sites[..i].contains(site) {
                return Err(KestrelError::InvalidPayload(format!(
                    "participant site {site} listed twice"
                )));
            }
        }

        let txn_id = self.next_txn_id();
        let label = plan.label();
        debug!(txn = %txn_id, op = %label, sites = ?sites, "distributed operation starting");
        let mut dtx: DistributedTransaction<TxnOf<C>> =
            DistributedTransaction::new(txn_id, sites.iter().cloned());

        // Prepare: concurrent fan-out, fan-in before the status advances.
        let prepare_budget = Duration::from_millis(self.config.prepare_timeout_ms);
        let prepare_started = Instant::now();
        let attempts = join_all(sites.iter().map(|site| async move {
            bounded(prepare_budget, site, "prepare", self.prepare_one(site, plan)).await
        }))
        .await;
        let prepare_latency_us = prepare_started.elapsed().as_micros() as u64;

        let mut failure: Option<KestrelError> = None;
        for (site, attempt) in sites.iter().zip(attempts) {
            match attempt {
                Ok(txn) => {
                    let p = dtx.participant_mut(site).ok_or_else(|| {
                        KestrelError::Internal(format!("participant {site} vanished"))
                    })?;
                    p.attach(txn);
                    p.mark_prepared(txn_id)?;
                }
                Err(e) => {
                    warn!(txn = %txn_id, op = %label, site = %site, error = %e, "prepare failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(err) = failure {
            dtx.advance(TxnStatus::Aborting)?;
            let rolled_back = self.rollback_open(txn_id, &mut dtx).await;
            dtx.advance(TxnStatus::Aborted)?;
            debug!(txn = %txn_id, rolled_back = ?rolled_back, "aborted during prepare");
            return Err(err);
        }
        dtx.advance(TxnStatus::Prepared)?;
        debug!(txn = %txn_id, "all participants prepared");

        // Commit: sequential, in participant order.
        dtx.advance(TxnStatus::Committing)?;
        self.intents.record_intent(txn_id, label.clone(), plan.intent());
        let commit_budget = Duration::from_millis(self.config.commit_timeout_ms);
        let commit_started = Instant::now();

        for i in 0..dtx.participants().len() {
            let site = dtx.participants()[i].site().clone();
            let step = match dtx.participants_mut()[i].txn_mut() {
                Some(txn) => bounded(commit_budget, &site, "commit", plan.apply(&site, txn)).await,
                None => Err(KestrelError::Internal(format!(
                    "participant {site} lost its local transaction"
                ))),
            };
            if let Err(e) = step {
                warn!(txn = %txn_id, site = %site, error = %e, "commit-side write failed; rolling back all participants");
                dtx.advance(TxnStatus::Aborting)?;
                let rolled_back = self.rollback_open(txn_id, &mut dtx).await;
                dtx.advance(TxnStatus::Aborted)?;
                self.intents.record_outcome(txn_id, IntentOutcome::Aborted);
                return Err(KestrelError::CommitFailed {
                    txn: txn_id,
                    site,
                    reason: e.to_string(),
                    committed: Vec::new(),
                    rolled_back,
                });
            }
        }

        let mut committed: Vec<SiteId> = Vec::new();
        for i in 0..dtx.participants().len() {
            let site = dtx.participants()[i].site().clone();
            let Some(txn) = dtx.participants_mut()[i].take_txn() else {
                return Err(KestrelError::Internal(format!(
                    "participant {site} lost its local transaction"
                )));
            };
            let outcome = bounded(commit_budget, &site, "commit", async move {
                txn.commit().await.map_err(KestrelError::from)
            })
            .await;
            match outcome {
                Ok(()) => {
                    dtx.participants_mut()[i].mark_committed(txn_id)?;
                    committed.push(site);
                }
                Err(e) => {
                    warn!(txn = %txn_id, site = %site, error = %e, "local commit failed");
                    dtx.advance(TxnStatus::Aborting)?;
                    let rolled_back = self.rollback_open(txn_id, &mut dtx).await;
                    dtx.advance(TxnStatus::Aborted)?;
                    self.intents.record_outcome(
                        txn_id,
                        if committed.is_empty() {
                            IntentOutcome::Aborted
                        } else {
                            IntentOutcome::Partial {
                                committed: committed.clone(),
                            }
                        },
                    );
                    let err = KestrelError::CommitFailed {
                        txn: txn_id,
                        site,
                        reason: e.to_string(),
                        committed,
                        rolled_back,
                    };
                    err.log_if_inconsistent();
                    return Err(err);
                }
            }
        }

        dtx.advance(TxnStatus::Committed)?;
        self.intents.record_outcome(txn_id, IntentOutcome::Committed);
        let commit_latency_us = commit_started.elapsed().as_micros() as u64;
        info!(
            txn = %txn_id,
            op = %label,
            sites = ?sites,
            prepare_us = prepare_latency_us,
            commit_us = commit_latency_us,
            "distributed operation committed"
        );
        Ok(TwoPhaseReport {
            txn_id,
            sites: sites.to_vec(),
            prepare_latency_us,
            commit_latency_us,
        })
    }

    async fn prepare_one<P>(&self, site: &SiteId, plan: &P) -> KestrelResult<TxnOf<C>>
    where
        P: TwoPhasePlan<TxnOf<C>>,
    {
        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        plan.prepare(site, &mut txn).await?;
        Ok(txn)
    }

    /// Roll back every participant that still holds an open local
    /// transaction, concurrently. Returns the sites rolled back;
    /// already-committed participants are untouched.
    async fn rollback_open(
        &self,
        txn_id: TxnId,
        dtx: &mut DistributedTransaction<TxnOf<C>>,
    ) -> Vec<SiteId> {
        let mut pending = Vec::new();
        for p in dtx.participants_mut() {
            if let Some(txn) = p.take_txn() {
                pending.push((p.site().clone(), txn));
            }
        }
        let results = join_all(pending.into_iter().map(|(site, txn)| async move {
            let result = txn.rollback().await;
            (site, result)
        }))
        .await;

        let mut rolled_back = Vec::new();
        for (site, result) in results {
            match result {
                Ok(()) => {
                    if let Some(p) = dtx.participant_mut(&site) {
                        if let Err(e) = p.mark_aborted(txn_id) {
                            error!(txn = %txn_id, site = %site, error = %e, "abort flag rejected");
                        }
                    }
                    rolled_back.push(site);
                }
                Err(e) => {
                    warn!(txn = %txn_id, site = %site, error = %e, "rollback failed; the site will expire the transaction itself");
                }
            }
        }
        rolled_back
    }
}

async fn bounded<T>(
    budget: Duration,
    site: &SiteId,
    phase: &'static str,
    work: impl Future<Output = KestrelResult<T>>,
) -> KestrelResult<T> {
    match timeout(budget, work).await {
        Ok(result) => result,
        Err(_) => Err(KestrelError::PhaseTimeout {
            site: site.clone(),
            phase,
            ms: budget.as_millis() as u64,
        }),
    }
}
