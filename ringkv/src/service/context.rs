//! Collaborator traits and the server context that bundles them.
//!
//! The storage engine, gossip, failure detection and topology information
//! are external subsystems. The core reaches them exclusively through these
//! traits; a [`ServerContext`] is constructed once at startup and passed
//! explicitly to every coordinator, so there are no process-wide singletons.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::TokenMetadata;
use crate::config::{Config, StrategyKind};
use crate::db::{ColumnFamily, RowMutation};
use crate::errors::{ConfigurationError, StoreError};
use crate::net::Transport;
use crate::routing::locator::{RackAwareOdklEvenStrategy, ReplicationStrategy, SimpleStrategy};
use crate::routing::partitioner::Partitioner;
use crate::routing::{Endpoint, Range, Token};

/// The local storage engine: commit log, memtables and sstables live behind
/// it. Applying a mutation is durable once the call returns.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn apply(&self, mutation: &RowMutation) -> Result<(), StoreError>;

    async fn read(&self, table: &str, key: &str) -> Result<Option<ColumnFamily>, StoreError>;

    /// Flushes the named column families (all of them when empty) of a table.
    async fn flush(&self, table: &str, column_families: &[String]) -> Result<(), StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;

    /// Rolls a fresh commit-log segment; part of draining.
    async fn roll_commit_log(&self) -> Result<(), StoreError>;

    async fn force_compaction(
        &self,
        table: &str,
        column_families: &[String],
    ) -> Result<(), StoreError>;

    /// Sampled split tokens inside `range`, roughly one per
    /// `keys_per_split` stored keys. Feeds ownership reporting and
    /// bootstrap-token selection.
    fn sample_splits(&self, range: &Range, keys_per_split: usize) -> Vec<Token>;
}

/// Cluster membership dissemination. The transport and protocol are out of
/// scope; the core only consumes membership facts and publishes its own
/// application state.
pub trait Gossiper: Send + Sync {
    fn get_live_members(&self) -> Vec<Endpoint>;

    fn get_dead_members(&self) -> Vec<Endpoint>;

    /// Heartbeat refresh for an endpoint we have just heard from directly.
    fn update_timestamp(&self, endpoint: Endpoint);

    /// Publishes a local application state, e.g. the `MOVE` ring state.
    fn add_local_application_state(&self, key: &str, value: &str);

    /// Compares the gossip startup generations of two endpoints; the later
    /// generation wins token-collision disputes.
    fn compare_endpoint_startup(&self, a: &Endpoint, b: &Endpoint) -> Ordering;

    /// Marks an endpoint as replaced by a newer instance.
    fn replaced_endpoint(&self, endpoint: Endpoint);

    /// Evicts an endpoint from gossip entirely.
    fn remove_endpoint(&self, endpoint: Endpoint);

    /// The load figure the endpoint last gossiped, if any.
    fn endpoint_load(&self, endpoint: &Endpoint) -> Option<f64>;

    fn stop(&self);

    fn start(&self);
}

/// Liveness oracle backed by the gossip failure detector.
pub trait FailureDetector: Send + Sync {
    fn is_alive(&self, endpoint: &Endpoint) -> bool;
}

/// Network topology information.
pub trait Snitch: Send + Sync {
    fn rack(&self, endpoint: &Endpoint) -> String;

    fn datacenter(&self, endpoint: &Endpoint) -> String;

    /// Sorts `endpoints` in place, closest to `relative_to` first.
    fn sort_by_proximity(&self, relative_to: &Endpoint, endpoints: &mut Vec<Endpoint>);

    /// The statically configured rack set, when the snitch has one. Used to
    /// validate rack-aware replication at construction instead of first use.
    fn configured_racks(&self) -> Option<BTreeSet<String>> {
        None
    }
}

/// Explicit statistics collaborator, invoked at well-defined points.
pub trait StatsSink: Send + Sync {
    fn read_repair_scheduled(&self) {}
    fn hint_stored(&self, _target: &Endpoint) {}
    fn hints_delivered(&self, _target: &Endpoint, _count: u64) {}
    fn compaction_started(&self, _table: &str) {}
    fn compaction_finished(&self, _table: &str) {}
    fn stats_tick(&self) {}
}

/// A [`StatsSink`] that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {}

/// Everything a coordinator needs, bundled at startup.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub partitioner: Arc<dyn Partitioner>,
    pub token_metadata: Arc<TokenMetadata>,
    pub transport: Arc<dyn Transport>,
    pub gossiper: Arc<dyn Gossiper>,
    pub failure_detector: Arc<dyn FailureDetector>,
    pub snitch: Arc<dyn Snitch>,
    pub store: Arc<dyn LocalStore>,
    pub stats: Arc<dyn StatsSink>,
    strategies: HashMap<StrategyKind, Arc<dyn ReplicationStrategy>>,
    mutations_enabled: AtomicBool,
}

impl ServerContext {
    /// Builds the context, constructing one replication strategy per kind in
    /// use. Rack-aware strategies validate their rack requirements here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        gossiper: Arc<dyn Gossiper>,
        failure_detector: Arc<dyn FailureDetector>,
        snitch: Arc<dyn Snitch>,
        store: Arc<dyn LocalStore>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, ConfigurationError> {
        let mut strategies: HashMap<StrategyKind, Arc<dyn ReplicationStrategy>> = HashMap::new();
        for (_, table_config) in config.tables() {
            if strategies.contains_key(&table_config.strategy) {
                continue;
            }
            let strategy: Arc<dyn ReplicationStrategy> = match table_config.strategy {
                StrategyKind::Simple => Arc::new(SimpleStrategy::new(config.clone())),
                StrategyKind::RackAwareOdklEven => Arc::new(RackAwareOdklEvenStrategy::new(
                    config.clone(),
                    snitch.clone(),
                )?),
            };
            strategies.insert(table_config.strategy, strategy);
        }

        Ok(ServerContext {
            partitioner: config.partitioner.build(),
            token_metadata: Arc::new(TokenMetadata::new()),
            config,
            transport,
            gossiper,
            failure_detector,
            snitch,
            store,
            stats,
            strategies,
            mutations_enabled: AtomicBool::new(true),
        })
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.config.listen_address
    }

    pub fn strategy(&self, table: &str) -> Result<Arc<dyn ReplicationStrategy>, ConfigurationError> {
        let kind = self.config.table(table)?.strategy;
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownTable(table.to_owned()))
    }

    /// Invalidates every memoized replica table; called whenever the ring
    /// changes.
    pub fn clear_endpoint_caches(&self) {
        for strategy in self.strategies.values() {
            strategy.clear_endpoint_cache();
        }
    }

    pub fn mutations_enabled(&self) -> bool {
        self.mutations_enabled.load(AtomicOrdering::Acquire)
    }

    /// Permanently gates the mutation stage; part of draining.
    pub fn disable_mutations(&self) {
        self.mutations_enabled.store(false, AtomicOrdering::Release);
    }
}

/// Drives the periodic [`StatsSink::stats_tick`] callback. The task runs
/// until the context is dropped.
pub fn spawn_stats_ticker(
    ctx: &Arc<ServerContext>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    let stats = ctx.stats.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            stats.stats_tick();
        }
    })
}
