//! End-to-end coordination tests over the in-memory mock cluster: quorum
//! reads with digest verification and repair, quorum writes with hinted
//! handoff, and pending-range write coverage.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use crate::cluster::PendingRangeMap;
use crate::config::{Config, StrategyKind};
use crate::coordinator::hints::{FileHintLog, HintedHandoffManager};
use crate::coordinator::{ConsistencyLevel, ReadCoordinator, WriteCoordinator};
use crate::db::{Column, ColumnFamily, RowMutation};
use crate::errors::{ReadError, WriteError};
use crate::net::Verb;
use crate::routing::{Range, Token};
use crate::utils::test_utils::{ep, TestCluster};

struct Fixture {
    cluster: TestCluster,
    read: Arc<ReadCoordinator>,
    write: WriteCoordinator,
    hints: Arc<HintedHandoffManager>,
}

/// Three-node ring with RF=3: tokens 40, 80, c0 on endpoints 1..=3; the
/// coordinator itself runs on endpoint 10 and owns no ranges.
fn rf3_fixture(consistency_workers: usize) -> Fixture {
    let mut config = Config::new("Test Cluster", ep(10)).with_table(
        "users",
        3,
        StrategyKind::Simple,
    );
    config.rpc_timeout = Duration::from_millis(200);
    config.consistency_workers = consistency_workers;
    let cluster = TestCluster::build(
        config,
        &[
            (ep(1), "R1"),
            (ep(2), "R2"),
            (ep(3), "R3"),
            (ep(4), "R1"),
            (ep(10), "R1"),
        ],
    );
    cluster.populate_ring(&[("40", ep(1)), ("80", ep(2)), ("c0", ep(3))]);

    let hint_log = Arc::new(
        FileHintLog::open(cluster.ctx.config.data_dir.join("hints")).expect("hint log"),
    );
    let hints = HintedHandoffManager::new(cluster.ctx.clone(), hint_log);
    let read = ReadCoordinator::new(cluster.ctx.clone());
    let write = WriteCoordinator::new(cluster.ctx.clone(), hints.clone());
    Fixture {
        cluster,
        read,
        write,
        hints,
    }
}

fn cf(cols: &[(&str, &str, i64)]) -> ColumnFamily {
    let mut cf = ColumnFamily::new();
    for &(name, value, ts) in cols {
        cf.insert(name, Column::live(value.as_bytes().to_vec(), ts));
    }
    cf
}

/// One replica holds a column the other two are missing: the read returns
/// the superset and exactly the stale replicas receive a repair.
#[tokio::test]
async fn read_repairs_stale_replicas() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;
    t.store(&ep(1)).put("users", "50", cf(&[("c1", "x", 10)]));
    t.store(&ep(2)).put("users", "50", cf(&[("c1", "x", 10)]));
    t.store(&ep(3))
        .put("users", "50", cf(&[("c1", "x", 10), ("c2", "y", 5)]));

    let row = f
        .read
        .read("users", "50", ConsistencyLevel::All)
        .await
        .unwrap();

    let resolved = row.cf.unwrap();
    assert_eq!(resolved.len(), 2);
    assert!(resolved.column("c2").is_some());

    assert_eq!(t.one_way_count(ep(1), Verb::ReadRepair), 1);
    assert_eq!(t.one_way_count(ep(2), Verb::ReadRepair), 1);
    assert_eq!(t.one_way_count(ep(3), Verb::ReadRepair), 0);

    // the one-way repairs have landed: all replicas now agree
    for n in 1..=3 {
        assert_eq!(t.store(&ep(n)).get("users", "50").unwrap(), resolved);
    }
}

/// A digest reply disagreeing with the data reply forces a full-data second
/// pass; the client still sees one merged row.
#[tokio::test]
async fn digest_mismatch_recovers_with_full_data_pass() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;
    // the closest replica (ep1, data read) is stale; ep2's digest mismatches
    t.store(&ep(1)).put("users", "50", cf(&[("c1", "old", 10)]));
    t.store(&ep(2)).put("users", "50", cf(&[("c1", "new", 20)]));
    t.store(&ep(3)).put("users", "50", cf(&[("c1", "new", 20)]));

    let row = f
        .read
        .read("users", "50", ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert_eq!(row.cf.unwrap().column("c1").unwrap().value, &b"new"[..]);
    // the stale data replica was repaired
    assert_eq!(t.one_way_count(ep(1), Verb::ReadRepair), 1);
}

/// With a quorum of replicas alive and responsive the read succeeds even
/// though one replica never answers.
#[tokio::test(start_paused = true)]
async fn quorum_read_succeeds_with_one_silent_replica() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;
    for n in 1..=3 {
        t.store(&ep(n)).put("users", "50", cf(&[("c1", "x", 10)]));
    }
    t.set_silent(ep(3));

    let row = f
        .read
        .read("users", "50", ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(row.cf.is_some());
}

#[tokio::test]
async fn read_unavailable_below_quorum() {
    let f = rf3_fixture(0);
    f.cluster.failure_detector.mark_down(ep(2));
    f.cluster.failure_detector.mark_down(ep(3));
    let err = f
        .read
        .read("users", "50", ConsistencyLevel::Quorum)
        .await
        .unwrap_err();
    assert_matches!(err, ReadError::Unavailable(u) if u.required == 2 && u.alive == 1);
}

#[tokio::test(start_paused = true)]
async fn read_times_out_without_responses() {
    let f = rf3_fixture(0);
    for n in 1..=3 {
        f.cluster.transport.set_silent(ep(n));
    }
    let err = f
        .read
        .read("users", "50", ConsistencyLevel::Quorum)
        .await
        .unwrap_err();
    assert_matches!(err, ReadError::Timeout { required: 2, .. });
}

/// A weak read kicks an asynchronous consistency check that repairs the
/// replicas behind the client's back.
#[tokio::test]
async fn weak_read_triggers_background_consistency_check() {
    let f = rf3_fixture(2);
    let t = &f.cluster.transport;
    t.store(&ep(1)).put("users", "50", cf(&[("c1", "x", 10)]));
    t.store(&ep(2)).put("users", "50", cf(&[("c1", "x", 10)]));
    t.store(&ep(3))
        .put("users", "50", cf(&[("c1", "x", 10), ("c2", "y", 5)]));

    f.read
        .read("users", "50", ConsistencyLevel::One)
        .await
        .unwrap();

    for _ in 0..200 {
        tokio::task::yield_now().await;
        if t.store(&ep(1)).get("users", "50").is_some_and(|cf| cf.len() == 2) {
            break;
        }
    }
    assert_eq!(t.store(&ep(1)).get("users", "50").unwrap().len(), 2);
}

/// A write at quorum with one dead replica succeeds and stores a hint;
/// replaying the hint after the replica recovers converges it.
#[tokio::test]
async fn hinted_handoff_converges_dead_replica() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;
    f.cluster.failure_detector.mark_down(ep(3));

    let mut mutation = RowMutation::new("users", "50");
    mutation.add("c1", &b"v"[..], 100);
    f.write
        .mutate(&mutation, ConsistencyLevel::Quorum)
        .await
        .unwrap();

    // quorum reached on the live replicas, hint queued for the dead one
    assert!(t.store(&ep(1)).get("users", "50").is_some());
    assert!(t.store(&ep(2)).get("users", "50").is_some());
    assert!(t.store(&ep(3)).get("users", "50").is_none());
    assert_eq!(f.hints.hint_log().pending(ep(3)).unwrap().len(), 1);

    // replica comes back; one delivery cycle drains the queue
    f.cluster.failure_detector.mark_up(ep(3));
    f.hints.deliver_hints_to_endpoint(ep(3)).await.unwrap();

    assert_eq!(
        t.store(&ep(3)).get("users", "50").unwrap(),
        cf(&[("c1", "v", 100)])
    );
    assert!(f.hints.hint_log().pending(ep(3)).unwrap().is_empty());

    // a read served by the recovered replica sees the write
    let row = f
        .read
        .read("users", "50", ConsistencyLevel::All)
        .await
        .unwrap();
    assert_eq!(row.cf.unwrap(), cf(&[("c1", "v", 100)]));
}

#[tokio::test]
async fn write_unavailable_stores_no_hints() {
    let f = rf3_fixture(0);
    f.cluster.failure_detector.mark_down(ep(2));
    f.cluster.failure_detector.mark_down(ep(3));

    let mut mutation = RowMutation::new("users", "50");
    mutation.add("c1", &b"v"[..], 100);
    let err = f
        .write
        .mutate(&mutation, ConsistencyLevel::Quorum)
        .await
        .unwrap_err();
    assert_matches!(err, WriteError::Unavailable(u) if u.alive == 1);
    // unavailability is detected before any dispatch or hinting
    assert!(f.hints.hint_log().pending(ep(2)).unwrap().is_empty());
    assert!(f.hints.hint_log().pending(ep(3)).unwrap().is_empty());
}

/// Replicas that never acknowledge get hints when the write deadline
/// expires; the client sees a timeout, not silent data loss.
#[tokio::test(start_paused = true)]
async fn write_timeout_hints_unacknowledged_replicas() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;
    t.set_silent(ep(2));
    t.set_silent(ep(3));

    let mut mutation = RowMutation::new("users", "50");
    mutation.add("c1", &b"v"[..], 100);
    let err = f
        .write
        .mutate(&mutation, ConsistencyLevel::Quorum)
        .await
        .unwrap_err();
    assert_matches!(err, WriteError::Timeout { acks: 1, required: 2 });

    assert_eq!(f.hints.hint_log().pending(ep(2)).unwrap().len(), 1);
    assert_eq!(f.hints.hint_log().pending(ep(3)).unwrap().len(), 1);
    assert!(f.hints.hint_log().pending(ep(1)).unwrap().is_empty());
}

#[tokio::test]
async fn draining_node_rejects_mutations() {
    let f = rf3_fixture(0);
    f.cluster.ctx.disable_mutations();
    let mutation = RowMutation::new("users", "50");
    assert_matches!(
        f.write.mutate(&mutation, ConsistencyLevel::One).await,
        Err(WriteError::Draining)
    );
}

/// While a range moves, writes also land on the pending endpoint, so the
/// future owner misses nothing.
#[tokio::test]
async fn writes_cover_pending_endpoints() {
    let f = rf3_fixture(0);
    let t = &f.cluster.transport;

    let mut pending = PendingRangeMap::new();
    pending.insert(
        Range::new(Token::new("40"), Token::new("80")),
        [ep(4)].into_iter().collect(),
    );
    f.cluster
        .ctx
        .token_metadata
        .set_pending_ranges("users", pending);

    let mut mutation = RowMutation::new("users", "50");
    mutation.add("c1", &b"v"[..], 100);
    f.write
        .mutate(&mutation, ConsistencyLevel::Quorum)
        .await
        .unwrap();

    // the pending endpoint received the write on top of the natural three
    assert!(t.store(&ep(4)).get("users", "50").is_some());

    // a key outside the moving range does not touch the pending endpoint
    let mut other = RowMutation::new("users", "90");
    other.add("c1", &b"v"[..], 100);
    f.write
        .mutate(&other, ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(t.store(&ep(4)).get("users", "90").is_none());
}

/// Writes at ConsistencyLevel::Zero return immediately and still reach the
/// replicas in the background.
#[tokio::test]
async fn zero_consistency_write_is_fire_and_forget() {
    let f = rf3_fixture(0);
    let mut mutation = RowMutation::new("users", "50");
    mutation.add("c1", &b"v"[..], 100);
    f.write
        .mutate(&mutation, ConsistencyLevel::Zero)
        .await
        .unwrap();

    for _ in 0..200 {
        tokio::task::yield_now().await;
        if f.cluster.transport.store(&ep(1)).get("users", "50").is_some() {
            break;
        }
    }
    assert!(f.cluster.transport.store(&ep(1)).get("users", "50").is_some());
}
