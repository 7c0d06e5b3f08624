//! Intent journal and recovery sweep.
//!
//! The coordinator records an intent when a transaction enters its commit
//! phase and the outcome once the phase ends, so a sweep running after a
//! crash or an acknowledged commit failure can tell an interrupted
//! transfer from corruption. The bundled journal is in-memory; durability
//! is an embedder seam, not a file format.
//!
//! The sweep derives every repair from observed site state:
//! - a copy stuck `in_transit` that exists nowhere else never had its
//!   transfer commit — prepare is not commit, so it is restored to
//!   `available`;
//! - a copy stuck `in_transit` that also exists at another site lost the
//!   race against its own transfer's destination commit — the stale source
//!   row is deleted;
//! - the same copy `available` at two sites is the acknowledged
//!   commit-failure window; the source row is deleted only when a journal
//!   record names the transfer's direction, otherwise both rows are left
//!   for manual reconciliation. The sweep never guesses destructively.
//!
//! Copies named by a still-active journal entry are skipped; the
//! transaction owning them is not done.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use kestrel_common::error::KestrelResult;
use kestrel_common::model::CopyStatus;
use kestrel_common::types::{SiteId, TxnId};
use kestrel_site::resolver::ConnectionResolver;
use kestrel_site::store::{SiteConnection, SiteConnector, SiteTransaction};

/// What a distributed transaction is about to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOp {
    TransferCopy {
        copy_id: String,
        from: SiteId,
        to: SiteId,
    },
    Replicated {
        key: String,
    },
}

impl IntentOp {
    pub fn copy_id(&self) -> Option<&str> {
        match self {
            IntentOp::TransferCopy { copy_id, .. } => Some(copy_id),
            IntentOp::Replicated { .. } => None,
        }
    }
}

/// Final outcome of a journaled transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    Committed,
    Aborted,
    /// The commit phase failed part-way; these sites kept the change.
    Partial { committed: Vec<SiteId> },
}

/// One journal entry. `outcome = None` means the transaction is still in
/// its commit phase (or the coordinator died inside it).
#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub txn_id: TxnId,
    pub label: String,
    pub op: IntentOp,
    pub outcome: Option<IntentOutcome>,
    pub recorded_at: Instant,
}

/// Journal of transaction intents and outcomes.
pub trait IntentLog: Send + Sync {
    fn record_intent(&self, txn_id: TxnId, label: String, op: IntentOp);
    fn record_outcome(&self, txn_id: TxnId, outcome: IntentOutcome);
    /// Records that have no outcome yet.
    fn active(&self) -> Vec<IntentRecord>;
    /// The newest record, settled or not, naming `copy_id`.
    fn last_for_copy(&self, copy_id: &str) -> Option<IntentRecord>;
}

/// Bounded in-memory journal. When full, the oldest settled record is
/// evicted; active records are never evicted, so the journal can exceed
/// its capacity while transactions are in flight.
pub struct MemoryIntentLog {
    records: RwLock<HashMap<TxnId, IntentRecord>>,
    capacity: usize,
}

impl MemoryIntentLog {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemoryIntentLog {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentLog for MemoryIntentLog {
    fn record_intent(&self, txn_id: TxnId, label: String, op: IntentOp) {
        let mut records = self.records.write();
        if records.len() >= self.capacity {
            let oldest_settled = records
                .values()
                .filter(|r| r.outcome.is_some())
                .min_by_key(|r| r.recorded_at)
                .map(|r| r.txn_id);
            if let Some(evict) = oldest_settled {
                records.remove(&evict);
            }
        }
        records.insert(
            txn_id,
            IntentRecord {
                txn_id,
                label,
                op,
                outcome: None,
                recorded_at: Instant::now(),
            },
        );
    }

    fn record_outcome(&self, txn_id: TxnId, outcome: IntentOutcome) {
        if let Some(record) = self.records.write().get_mut(&txn_id) {
            record.outcome = Some(outcome);
        }
    }

    fn active(&self) -> Vec<IntentRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.outcome.is_none())
            .cloned()
            .collect()
    }

    fn last_for_copy(&self, copy_id: &str) -> Option<IntentRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.op.copy_id() == Some(copy_id))
            .max_by_key(|r| r.recorded_at)
            .cloned()
    }
}

/// What one sweep saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sites_scanned: usize,
    pub stray_in_transit: usize,
    pub restored_available: usize,
    pub completed_transfers: usize,
    pub duplicates_found: usize,
    pub duplicates_resolved: usize,
    pub skipped_active: usize,
    pub repair_failures: usize,
}

/// Scans every configured site's copies and repairs what a torn transfer
/// left behind.
pub struct RecoverySweep<C: SiteConnector> {
    resolver: Arc<ConnectionResolver<C>>,
    intents: Arc<dyn IntentLog>,
    max_repairs: usize,
}

impl<C: SiteConnector> RecoverySweep<C> {
    pub fn new(
        resolver: Arc<ConnectionResolver<C>>,
        intents: Arc<dyn IntentLog>,
        max_repairs: usize,
    ) -> Self {
        Self {
            resolver,
            intents,
            max_repairs: max_repairs.max(1),
        }
    }

    pub async fn sweep(&self) -> KestrelResult<SweepReport> {
        let mut report = SweepReport::default();
        let active_copies: HashSet<String> = self
            .intents
            .active()
            .iter()
            .filter_map(|r| r.op.copy_id().map(str::to_string))
            .collect();

        // Inventory pass: where does every copy id live, and in what state.
        let sites = self.resolver.site_ids().to_vec();
        let mut placement: HashMap<String, Vec<(SiteId, CopyStatus)>> = HashMap::new();
        for site in &sites {
            let conn = self.resolver.resolve(site).await?;
            let mut txn = conn.begin().await?;
            let rows = txn.list_copies().await?;
            txn.rollback().await?;
            for copy in rows {
                placement
                    .entry(copy.copy_id)
                    .or_default()
                    .push((site.clone(), copy.status));
            }
            report.sites_scanned += 1;
        }

        let mut copy_ids: Vec<String> = placement.keys().cloned().collect();
        copy_ids.sort();

        let mut repairs = 0usize;
        for copy_id in copy_ids {
            if repairs >= self.max_repairs {
                info!(
                    budget = self.max_repairs,
                    "repair budget exhausted; remaining strays wait for the next sweep"
                );
                break;
            }
            let locations = &placement[&copy_id];
            let in_transit: Vec<SiteId> = locations
                .iter()
                .filter(|(_, status)| *status == CopyStatus::InTransit)
                .map(|(site, _)| site.clone())
                .collect();

            if locations.len() == 1 {
                if in_transit.is_empty() {
                    continue;
                }
                report.stray_in_transit += 1;
                if active_copies.contains(&copy_id) {
                    report.skipped_active += 1;
                    continue;
                }
                let site = &in_transit[0];
                match self.restore_available(site, &copy_id).await {
                    Ok(1) => {
                        info!(copy = %copy_id, site = %site, "restored stray in_transit copy");
                        report.restored_available += 1;
                        repairs += 1;
                    }
                    Ok(_) => debug!(copy = %copy_id, site = %site, "stray repaired underneath us"),
                    Err(e) => {
                        warn!(copy = %copy_id, site = %site, error = %e, "restore failed");
                        report.repair_failures += 1;
                    }
                }
                continue;
            }

            report.duplicates_found += 1;
            report.stray_in_transit += in_transit.len();
            if active_copies.contains(&copy_id) {
                report.skipped_active += 1;
                continue;
            }

            if in_transit.len() == locations.len() {
                warn!(copy = %copy_id, sites = ?in_transit, "copy in_transit at every site; manual reconciliation required");
            } else if !in_transit.is_empty() {
                // The in_transit rows are stale source halves of transfers
                // whose destination commit landed.
                let mut resolved = true;
                for site in &in_transit {
                    match self.delete_stale(site, &copy_id).await {
                        Ok(1) => {
                            info!(copy = %copy_id, site = %site, "deleted stale source row of a committed transfer");
                            report.completed_transfers += 1;
                            repairs += 1;
                        }
                        Ok(_) => debug!(copy = %copy_id, site = %site, "stale row vanished underneath us"),
                        Err(e) => {
                            warn!(copy = %copy_id, site = %site, error = %e, "stale-row delete failed");
                            report.repair_failures += 1;
                            resolved = false;
                        }
                    }
                }
                if resolved {
                    report.duplicates_resolved += 1;
                }
            } else if let Some(record) = self.intents.last_for_copy(&copy_id) {
                match &record.op {
                    IntentOp::TransferCopy { from, to, .. }
                        if locations.iter().any(|(s, _)| s == from)
                            && locations.iter().any(|(s, _)| s == to) =>
                    {
                        match self.delete_stale(from, &copy_id).await {
                            Ok(1) => {
                                info!(
                                    copy = %copy_id,
                                    txn = %record.txn_id,
                                    from = %from,
                                    to = %to,
                                    "resolved duplicate from journal record"
                                );
                                report.duplicates_resolved += 1;
                                repairs += 1;
                            }
                            Ok(_) => debug!(copy = %copy_id, "duplicate resolved underneath us"),
                            Err(e) => {
                                warn!(copy = %copy_id, error = %e, "journal-guided delete failed");
                                report.repair_failures += 1;
                            }
                        }
                    }
                    _ => {
                        warn!(copy = %copy_id, record = %record.label, "duplicate copy the journal cannot explain; manual reconciliation required");
                    }
                }
            } else {
                warn!(copy = %copy_id, "duplicate copy with no journal record; manual reconciliation required");
            }
        }
        Ok(report)
    }

    async fn restore_available(&self, site: &SiteId, copy_id: &str) -> KestrelResult<u64> {
        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        let changed = txn
            .update_copy_status(copy_id, CopyStatus::InTransit, CopyStatus::Available)
            .await?;
        txn.commit().await?;
        Ok(changed)
    }

    async fn delete_stale(&self, site: &SiteId, copy_id: &str) -> KestrelResult<u64> {
        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        let removed = txn.delete_copy(copy_id).await?;
        txn.commit().await?;
        Ok(removed)
    }
}
