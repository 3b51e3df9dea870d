//! Ring state machine tests: gossip-driven membership transitions, pending
//! range coverage during topology changes, and the local lifecycle
//! operations.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use crate::cluster::{OperationMode, RingController, RingState};
use crate::config::{Config, StrategyKind};
use crate::coordinator::hints::{FileHintLog, HintedHandoffManager};
use crate::errors::RingError;
use crate::net::move_state::MOVE_STATE;
use crate::routing::{Endpoint, Token};
use crate::utils::test_utils::{ep, TestCluster};

struct Fixture {
    cluster: TestCluster,
    controller: Arc<RingController>,
}

/// A cluster of five storage nodes plus the local node on endpoint 10,
/// with RF=2 over a simple strategy.
fn fixture() -> Fixture {
    let mut config = Config::new("Test Cluster", ep(10)).with_table(
        "users",
        2,
        StrategyKind::Simple,
    );
    config.rpc_timeout = Duration::from_millis(200);
    config.ring_delay = Duration::ZERO;
    config.gossip_settle = Duration::ZERO;
    config.consistency_workers = 0;
    let cluster = TestCluster::build(
        config,
        &[
            (ep(1), "R1"),
            (ep(2), "R2"),
            (ep(3), "R1"),
            (ep(4), "R2"),
            (ep(5), "R1"),
            (ep(10), "R2"),
        ],
    );
    let hint_log = Arc::new(
        FileHintLog::open(cluster.ctx.config.data_dir.join("hints")).expect("hint log"),
    );
    let hints = HintedHandoffManager::new(cluster.ctx.clone(), hint_log);
    let controller = RingController::new(cluster.ctx.clone(), hints).expect("controller");
    Fixture {
        cluster,
        controller,
    }
}

fn t(s: &str) -> Token {
    Token::new(s)
}

impl Fixture {
    fn ring(&self) -> Arc<RingState> {
        self.cluster.ctx.token_metadata.snapshot()
    }

    fn on_change(&self, endpoint: Endpoint, value: &str) {
        self.controller.on_change(endpoint, MOVE_STATE, value);
    }

    fn last_gossiped(&self) -> Option<String> {
        self.cluster.gossiper.last_state(MOVE_STATE)
    }
}

/// BOOT puts the endpoint into the bootstrap map and its future ranges into
/// the pending set; NORMAL promotes it and clears both.
#[tokio::test]
async fn bootstrap_state_transitions() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);

    f.on_change(ep(3), "BOOT,80");
    let ring = f.ring();
    assert_eq!(ring.bootstrap_tokens().get(&t("80")), Some(&ep(3)));
    assert!(!ring.is_member(&ep(3)));
    // writes for the arc the bootstrapping node will own must reach it
    assert!(!ring.pending_ranges_for_endpoint("users", &ep(3)).is_empty());
    assert!(ring
        .pending_endpoints_for(&t("70"), "users")
        .contains(&ep(3)));

    f.on_change(ep(3), "NORMAL,80");
    let ring = f.ring();
    assert!(ring.bootstrap_tokens().is_empty());
    assert_eq!(ring.endpoint(&t("80")), Some(ep(3)));
    assert!(!ring.has_pending_ranges());
}

/// A node we never saw boot can still jump straight to NORMAL.
#[tokio::test]
async fn normal_state_jump_registers_member() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1))]);
    f.on_change(ep(2), "NORMAL,c0");
    assert_eq!(f.ring().endpoint(&t("c0")), Some(ep(2)));
}

/// Token collisions go to the endpoint with the younger gossip generation;
/// the loser is marked replaced.
#[tokio::test]
async fn token_collision_resolved_by_startup_generation() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.cluster.gossiper.set_generation(ep(1), 5);

    // older generation loses: the claim is ignored
    f.cluster.gossiper.set_generation(ep(3), 3);
    f.on_change(ep(3), "NORMAL,40");
    assert_eq!(f.ring().endpoint(&t("40")), Some(ep(1)));
    assert!(f.cluster.gossiper.replaced.lock().unwrap().contains(&ep(3)));

    // younger generation wins the token
    f.cluster.gossiper.set_generation(ep(4), 9);
    f.on_change(ep(4), "NORMAL,40");
    assert_eq!(f.ring().endpoint(&t("40")), Some(ep(4)));
    assert!(f.cluster.gossiper.replaced.lock().unwrap().contains(&ep(1)));
}

/// LEAVING computes pending ranges covering everything the leaver will shed;
/// LEFT drops the endpoint and the pending ranges with it.
#[tokio::test]
async fn leaving_then_left_hands_ranges_over() {
    let f = fixture();
    f.cluster
        .populate_ring(&[("40", ep(1)), ("80", ep(2)), ("c0", ep(3))]);

    f.on_change(ep(2), "LEAVING,80");
    let ring = f.ring();
    assert!(ring.is_leaving(&ep(2)));
    assert!(ring.has_pending_ranges());

    // every endpoint serving a range after the leave is either already a
    // natural endpoint or pending for it (writes are never lost)
    let strategy = f.cluster.ctx.strategy("users").unwrap();
    let after_left = ring.clone_after_all_left();
    for key in ["10", "50", "70", "90", "b0", "f0"] {
        let token = t(key);
        let future = strategy
            .calculate_natural_endpoints(&token, &after_left, "users")
            .unwrap();
        let current = strategy
            .calculate_natural_endpoints(&token, &ring, "users")
            .unwrap();
        let pending = ring.pending_endpoints_for(&token, "users");
        for endpoint in future {
            assert!(
                current.contains(&endpoint) || pending.contains(&endpoint),
                "future replica {endpoint} of key {key} not covered"
            );
        }
    }

    f.on_change(ep(2), "LEFT,80");
    let ring = f.ring();
    assert!(!ring.is_member(&ep(2)));
    assert!(!ring.has_pending_ranges());
}

/// `NORMAL,t,remove,t2` evicts the dead owner of `t2` and triggers replica
/// restoration streams toward the nodes that inherit its ranges.
#[tokio::test]
async fn remove_token_gossip_evicts_dead_node() {
    let f = fixture();
    f.cluster
        .populate_ring(&[("40", ep(1)), ("80", ep(2)), ("c0", ep(3))]);

    f.on_change(ep(1), "NORMAL,40,remove,80");
    let ring = f.ring();
    assert!(!ring.is_member(&ep(2)));
    assert_eq!(ring.endpoint(&t("80")), None);
    assert!(f.cluster.gossiper.removed.lock().unwrap().contains(&ep(2)));
}

/// A fresh node bootstraps: announces BOOT, streams its ranges in, then
/// joins as NORMAL with the token persisted.
#[tokio::test]
async fn local_bootstrap_joins_ring() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);

    f.controller.start(Some(t("80"))).await.unwrap();

    assert_eq!(f.controller.operation_mode(), OperationMode::Normal);
    assert_eq!(f.ring().endpoint(&t("80")), Some(ep(10)));
    assert_eq!(f.controller.local_token(), Some(t("80")));
    assert_eq!(f.last_gossiped().unwrap(), "NORMAL,80");
    // data was requested from the previous owners
    assert!(!f.cluster.transport.stream_log.lock().unwrap().is_empty());
}

/// A node that already bootstrapped rejoins with its saved token and skips
/// the bootstrap dance.
#[tokio::test]
async fn restart_rejoins_with_saved_token() {
    let f = fixture();
    f.controller.start(Some(t("80"))).await.unwrap();

    // same data dir, fresh controller: the saved record drives the rejoin
    let hint_log = Arc::new(
        FileHintLog::open(f.cluster.ctx.config.data_dir.join("hints")).unwrap(),
    );
    let hints = HintedHandoffManager::new(f.cluster.ctx.clone(), hint_log);
    let restarted = RingController::new(f.cluster.ctx.clone(), hints).unwrap();
    assert_eq!(restarted.generation(), f.controller.generation() + 1);

    restarted.start(None).await.unwrap();
    assert_eq!(restarted.operation_mode(), OperationMode::Normal);
    assert_eq!(restarted.local_token(), Some(t("80")));
}

#[tokio::test]
async fn manual_bootstrap_waits_for_resume() {
    let mut config = Config::new("Test Cluster", ep(10)).with_table(
        "users",
        2,
        StrategyKind::Simple,
    );
    config.ring_delay = Duration::ZERO;
    config.gossip_settle = Duration::ZERO;
    config.manual_bootstrap_resume = true;
    let cluster = TestCluster::build(config, &[(ep(1), "R1"), (ep(10), "R2")]);
    cluster.populate_ring(&[("40", ep(1))]);
    let hint_log = Arc::new(
        FileHintLog::open(cluster.ctx.config.data_dir.join("hints")).unwrap(),
    );
    let hints = HintedHandoffManager::new(cluster.ctx.clone(), hint_log);
    let controller = RingController::new(cluster.ctx.clone(), hints).unwrap();

    let starter = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(Some(Token::new("80"))).await })
    };
    for _ in 0..200 {
        tokio::task::yield_now().await;
        if controller.operation_mode() == OperationMode::Joining {
            break;
        }
    }
    assert_eq!(controller.operation_mode(), OperationMode::Joining);
    assert!(!cluster.ctx.token_metadata.is_member(&ep(10)));

    controller.resume_bootstrap();
    starter.await.unwrap().unwrap();
    assert_eq!(controller.operation_mode(), OperationMode::Normal);
    assert!(cluster.ctx.token_metadata.is_member(&ep(10)));
}

/// Decommission: LEAVING spreads, owned ranges stream to their new owners,
/// the node leaves the ring and gossip stops.
#[tokio::test]
async fn decommission_leaves_ring() {
    let f = fixture();
    f.cluster
        .populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("80"))).await.unwrap();
    f.cluster.transport.stream_log.lock().unwrap().clear();

    f.controller.decommission().await.unwrap();

    assert_eq!(f.controller.operation_mode(), OperationMode::Decommissioned);
    assert!(!f.cluster.ctx.token_metadata.is_member(&ep(10)));
    assert!(f.cluster.gossiper.is_stopped());
    assert_eq!(f.last_gossiped().unwrap(), "LEFT,80");
    // the ranges this node held were handed off before leaving
    assert!(!f.cluster.transport.stream_log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn decommission_requires_other_members() {
    let f = fixture();
    f.controller.start(Some(t("80"))).await.unwrap();
    assert_matches!(
        f.controller.decommission().await,
        Err(RingError::NoOtherMembers)
    );
}

/// Moving re-bootstraps the node at the target token.
#[tokio::test]
async fn move_relocates_local_token() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("80"))).await.unwrap();

    f.controller.move_token(Some(t("a0"))).await.unwrap();

    assert_eq!(f.controller.local_token(), Some(t("a0")));
    let ring = f.ring();
    assert_eq!(ring.endpoint(&t("a0")), Some(ep(10)));
    assert_eq!(ring.endpoint(&t("80")), None);
    assert_eq!(f.controller.operation_mode(), OperationMode::Normal);
}

#[tokio::test]
async fn move_rejects_owned_token() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("80"))).await.unwrap();
    assert_matches!(
        f.controller.move_token(Some(t("40"))).await,
        Err(RingError::TokenAlreadyOwned(token)) if token == "40"
    );
}

/// Load balancing asks the most loaded node for a token splitting its
/// range and moves there.
#[tokio::test]
async fn load_balance_moves_to_most_loaded_split() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("20"))).await.unwrap();

    f.cluster.gossiper.set_live(&[ep(1), ep(2)]);
    f.cluster.gossiper.set_load(ep(1), 10.0);
    f.cluster.gossiper.set_load(ep(2), 90.0);
    f.cluster.transport.set_bootstrap_token_reply(ep(2), "a0");

    f.controller.load_balance().await.unwrap();
    assert_eq!(f.controller.local_token(), Some(t("a0")));
    assert_eq!(f.ring().endpoint(&t("a0")), Some(ep(10)));
}

/// The operator removes a dead node's token: replicas are restored from
/// live sources and the removal is gossiped as an extra state.
#[tokio::test]
async fn remove_token_operation() {
    let f = fixture();
    f.cluster
        .populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("80"))).await.unwrap();
    f.cluster.failure_detector.mark_down(ep(2));

    f.controller.remove_token(&t("c0")).unwrap();

    let ring = f.ring();
    assert!(!ring.is_member(&ep(2)));
    assert!(f.cluster.gossiper.removed.lock().unwrap().contains(&ep(2)));
    assert_eq!(f.last_gossiped().unwrap(), "NORMAL,80,remove,c0");

    assert_matches!(
        f.controller.remove_token(&t("zz")),
        Err(RingError::UnknownToken(_))
    );
    assert_matches!(
        f.controller.remove_token(&t("80")),
        Err(RingError::RemovingSelf)
    );
}

/// Drain flushes, rolls the commit log and permanently gates mutations.
#[tokio::test]
async fn drain_quiesces_the_node() {
    let f = fixture();
    f.controller.start(Some(t("80"))).await.unwrap();

    f.controller.drain().await.unwrap();

    assert_eq!(f.controller.operation_mode(), OperationMode::Drained);
    assert!(!f.cluster.ctx.mutations_enabled());
    let store = f.cluster.transport.store(&ep(10));
    assert!(store.flushes.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert!(store.commit_log_rolls.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    assert_matches!(f.controller.drain().await, Err(RingError::InvalidState(_)));
}

/// The bootstrap-token a node offers splits its primary range: the median
/// sampled key when enough samples exist, the midpoint otherwise.
#[tokio::test]
async fn local_bootstrap_token_splits_primary_range() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    f.controller.start(Some(t("80"))).await.unwrap();

    let store = f.cluster.transport.store(&ep(10));
    store.set_splits(vec![t("50"), t("60"), t("70")]);
    assert_eq!(f.controller.local_bootstrap_token().unwrap(), t("60"));

    store.set_splits(vec![t("50")]);
    let sparse = f.controller.local_bootstrap_token().unwrap();
    // midpoint of (40, 80]
    assert!(sparse > t("40") && sparse < t("80"), "{sparse}");
}

/// Ring mutations drop memoized replica lists, so reads immediately see the
/// new topology.
#[tokio::test]
async fn ring_changes_invalidate_endpoint_caches() {
    let f = fixture();
    f.cluster.populate_ring(&[("40", ep(1)), ("c0", ep(2))]);
    let strategy = f.cluster.ctx.strategy("users").unwrap();

    let before = strategy
        .get_natural_endpoints(&t("80"), &f.ring(), "users")
        .unwrap();
    assert_eq!(before, vec![ep(2), ep(1)]);

    f.on_change(ep(3), "NORMAL,80");
    let after = strategy
        .get_natural_endpoints(&t("80"), &f.ring(), "users")
        .unwrap();
    assert_eq!(after, vec![ep(3), ep(2)]);
}
