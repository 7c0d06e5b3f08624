//! End-to-end transfer coverage over the in-memory backend.
//!
//! Properties verified here:
//! - a committed transfer moves the row: present at the destination with
//!   its fragment key rewritten, gone from the source;
//! - any prepare failure (availability, duplicate destination, unknown,
//!   unreachable or unresponsive site) rolls every participant back and
//!   mutates nothing, the tentative in_transit mark included;
//! - repeating a finished transfer fails cleanly without touching state;
//! - a commit-phase fault surfaces as a commit failure naming exactly the
//!   sites that kept the change, and the destination-first commit order
//!   biases the damage toward a detectable duplicate, never a lost row.

use std::sync::Arc;

use kestrel_cluster::recovery::IntentOutcome;
use kestrel_cluster::two_phase::TwoPhaseCoordinator;
use kestrel_common::config::{CoordinatorConfig, KestrelConfig, ResolverConfig, SiteConfig};
use kestrel_common::error::{ConnectionError, KestrelError};
use kestrel_common::model::{BookCopy, CopyStatus};
use kestrel_common::types::SiteId;
use kestrel_site::mem::MemConnector;
use kestrel_site::resolver::ConnectionResolver;

fn config(ids: &[&str]) -> KestrelConfig {
    KestrelConfig {
        sites: ids
            .iter()
            .map(|id| SiteConfig {
                site_id: id.to_string(),
                database: format!("library_{}", id.to_lowercase()),
                ..SiteConfig::default()
            })
            .collect(),
        resolver: ResolverConfig {
            probe_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
            connect_timeout_ms: 1_000,
        },
        coordinator: CoordinatorConfig {
            prepare_timeout_ms: 2_000,
            commit_timeout_ms: 2_000,
            sweep_max_repairs: 32,
        },
    }
}

fn setup(ids: &[&str]) -> (MemConnector, TwoPhaseCoordinator<MemConnector>) {
    let cfg = config(ids);
    let connector = MemConnector::new();
    let resolver = Arc::new(ConnectionResolver::new(connector.clone(), &cfg));
    let coordinator = TwoPhaseCoordinator::new(resolver, cfg.coordinator);
    (connector, coordinator)
}

fn q(id: &str) -> SiteId {
    SiteId::new(id)
}

fn copy(copy_id: &str, branch: &str, status: CopyStatus) -> BookCopy {
    BookCopy {
        copy_id: copy_id.to_string(),
        isbn: "978-0-000001".to_string(),
        branch_id: branch.to_string(),
        status,
    }
}

// ════════════════════════════════════════════════════════════════════════
// committed transfers
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_transfer_moves_copy_between_sites() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));

    let report = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap();

    assert_eq!(
        report.sites,
        vec![q("Q3"), q("Q1")],
        "destination must come first in commit order"
    );
    assert!(
        connector.site(&q("Q1")).get_copy("QS001").is_none(),
        "source must no longer list the copy"
    );
    let landed = connector.site(&q("Q3")).get_copy("QS001").unwrap();
    assert_eq!(landed.branch_id, "Q3", "fragment key must follow the row");
    assert_eq!(landed.status, CopyStatus::Available);
    assert_eq!(landed.isbn, "978-0-000001");
}

#[tokio::test]
async fn test_repeat_transfer_fails_cleanly_and_mutates_nothing() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));

    coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap();
    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    match &err {
        KestrelError::PrepareFailed { reason, .. } => {
            assert!(
                reason.contains("not found") || reason.contains("already present"),
                "reason was: {reason}"
            );
        }
        other => panic!("expected a prepare failure, got {other:?}"),
    }
    assert!(connector.site(&q("Q1")).get_copy("QS001").is_none());
    assert_eq!(connector.site(&q("Q3")).copy_count(), 1);
    assert_eq!(
        connector.site(&q("Q3")).get_copy("QS001").unwrap().status,
        CopyStatus::Available
    );
}

// ════════════════════════════════════════════════════════════════════════
// prepare failures roll everything back
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_borrowed_copy_is_not_transferable() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Borrowed));

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_user_error());
    match &err {
        KestrelError::PrepareFailed { site, reason } => {
            assert_eq!(*site, q("Q1"));
            assert!(
                reason.contains("not available for transfer"),
                "reason was: {reason}"
            );
        }
        other => panic!("expected a prepare failure, got {other:?}"),
    }
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Borrowed,
        "source row must be untouched"
    );
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
}

#[tokio::test]
async fn test_missing_copy_fails_prepare() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);

    let err = coordinator
        .transfer_copy("QS404", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    match &err {
        KestrelError::PrepareFailed { reason, .. } => {
            assert!(reason.contains("not found"), "reason was: {reason}");
        }
        other => panic!("expected a prepare failure, got {other:?}"),
    }
    assert_eq!(connector.site(&q("Q3")).copy_count(), 0);
}

#[tokio::test]
async fn test_occupied_destination_aborts_both_sides() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector
        .site(&q("Q3"))
        .seed_copy(copy("QS001", "Q3", CopyStatus::Available));

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    match &err {
        KestrelError::PrepareFailed { site, reason } => {
            assert_eq!(*site, q("Q3"));
            assert!(reason.contains("already present"), "reason was: {reason}");
        }
        other => panic!("expected a prepare failure, got {other:?}"),
    }
    // The source's tentative in_transit mark must have rolled back.
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available
    );
}

#[tokio::test]
async fn test_transfer_to_same_site_rejected_before_dialing() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q1"))
        .await
        .unwrap_err();

    assert!(matches!(err, KestrelError::InvalidPayload(_)), "got {err:?}");
    assert_eq!(connector.site(&q("Q1")).connects(), 0, "nothing dialed");
    assert_eq!(connector.site(&q("Q1")).begins(), 0, "no transaction opened");
}

#[tokio::test]
async fn test_unknown_destination_aborts_the_source() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q9"))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            KestrelError::Connection(ConnectionError::UnknownSite(_))
        ),
        "got {err:?}"
    );
    assert_eq!(connector.site(&q("Q9")).connects(), 0, "unknown site never dialed");
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available,
        "source prepare must roll back"
    );
}

#[tokio::test]
async fn test_unreachable_source_aborts_cleanly() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector.site(&q("Q1")).faults.refuse_connects(10);

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "got {err:?}");
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available
    );
}

#[tokio::test]
async fn test_unresponsive_destination_times_out_the_prepare_phase() {
    // A site that accepts the connection but stalls must not hold the
    // transfer past the prepare budget.
    let mut cfg = config(&["Q1", "Q3"]);
    cfg.coordinator.prepare_timeout_ms = 200;
    let connector = MemConnector::new();
    let resolver = Arc::new(ConnectionResolver::new(connector.clone(), &cfg));
    let coordinator = TwoPhaseCoordinator::new(resolver, cfg.coordinator);

    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector.site(&q("Q3")).faults.delay_next_begin(30_000);

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "got {err:?}");
    match &err {
        KestrelError::PhaseTimeout { site, phase, .. } => {
            assert_eq!(*site, q("Q3"));
            assert_eq!(*phase, "prepare");
        }
        other => panic!("expected a phase timeout, got {other:?}"),
    }
    assert_eq!(
        connector.site(&q("Q3")).begins(), 1,
        "the stalled begin was reached, then abandoned"
    );
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available,
        "the source's tentative mark must roll back"
    );
}

#[tokio::test]
async fn test_begin_fault_at_the_destination_aborts_the_source() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector.site(&q("Q3")).faults.fail_next_begin();

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "got {err:?}");
    assert_eq!(
        connector.site(&q("Q3")).begins(), 1,
        "the begin was attempted and refused"
    );
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available,
        "the source's tentative mark must roll back"
    );
}

// ════════════════════════════════════════════════════════════════════════
// commit-phase faults
// ════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_commit_fault_at_source_leaves_detectable_duplicate() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector.site(&q("Q1")).faults.fail_next_commit();

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_inconsistency(), "got {err:?}");
    match &err {
        KestrelError::CommitFailed {
            site,
            committed,
            rolled_back,
            ..
        } => {
            assert_eq!(*site, q("Q1"), "the failure hit the source commit");
            assert_eq!(committed, &vec![q("Q3")]);
            assert!(rolled_back.is_empty());
        }
        other => panic!("expected a commit failure, got {other:?}"),
    }
    assert_eq!(err.committed_sites(), &[q("Q3")]);

    // Destination-first ordering bias: the row survives at both sites
    // rather than vanishing from both.
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_some());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available,
        "failed source commit rolls its local transaction back"
    );

    // The journal recorded the torn outcome for the recovery sweep.
    let record = coordinator.intent_log().last_for_copy("QS001").unwrap();
    assert_eq!(
        record.outcome,
        Some(IntentOutcome::Partial {
            committed: vec![q("Q3")]
        })
    );
}

#[tokio::test]
async fn test_commit_fault_at_destination_rolls_back_cleanly() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    connector.site(&q("Q3")).faults.fail_next_commit();

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    // The destination commits first; when it fails nothing has committed
    // yet, so the outcome is a clean rollback.
    assert!(err.is_transient(), "got {err:?}");
    match &err {
        KestrelError::CommitFailed {
            site, committed, ..
        } => {
            assert_eq!(*site, q("Q3"));
            assert!(committed.is_empty());
        }
        other => panic!("expected a commit failure, got {other:?}"),
    }
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available
    );
}

#[tokio::test]
async fn test_commit_side_write_fault_aborts_before_any_commit() {
    let (connector, coordinator) = setup(&["Q1", "Q3"]);
    connector
        .site(&q("Q1"))
        .seed_copy(copy("QS001", "Q1", CopyStatus::Available));
    // Fails the destination's commit-side insert, before any local commit.
    connector.site(&q("Q3")).faults.fail_next_write();

    let err = coordinator
        .transfer_copy("QS001", &q("Q1"), &q("Q3"))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "got {err:?}");
    match &err {
        KestrelError::CommitFailed {
            committed,
            rolled_back,
            ..
        } => {
            assert!(committed.is_empty());
            assert_eq!(
                rolled_back.len(),
                2,
                "both participants were still open and rolled back"
            );
        }
        other => panic!("expected a commit failure, got {other:?}"),
    }
    assert!(connector.site(&q("Q3")).get_copy("QS001").is_none());
    assert_eq!(
        connector.site(&q("Q1")).get_copy("QS001").unwrap().status,
        CopyStatus::Available
    );
}
