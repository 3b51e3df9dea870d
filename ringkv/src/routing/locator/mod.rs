//! Replica placement: from a key's token to the ordered list of endpoints
//! owning it.
//!
//! Two strategies exist behind one trait. [`SimpleStrategy`] walks the ring
//! clockwise taking successive distinct endpoints. The
//! [`RackAwareOdklEvenStrategy`] additionally guarantees that no two
//! replicas share a rack by carving the ring into per-rack sub-rings: the
//! primary replica comes off the full ring, every further replica off the
//! sub-ring of a still-unused rack, re-keyed by a bit-permuted domain so
//! secondary load spreads evenly instead of following the primary around
//! the ring.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;
use tracing::info;

use crate::cluster::RingState;
use crate::config::{Config, StrategyKind};
use crate::errors::ConfigurationError;
use crate::routing::partitioner::OdklDomainPartitioner;
use crate::routing::{Endpoint, Range, Token};
use crate::service::Snitch;

/// Memoized `token → replica list` table, invalidated wholesale whenever the
/// ring changes. The key is strategy-defined: just enough of the search
/// token to pin the full placement down.
#[derive(Debug, Default)]
pub struct EndpointCache {
    map: DashMap<(String, String), Arc<Vec<Endpoint>>>,
}

impl EndpointCache {
    fn get(&self, table: &str, routing_key: &str) -> Option<Arc<Vec<Endpoint>>> {
        self.map
            .get(&(table.to_owned(), routing_key.to_owned()))
            .map(|entry| entry.value().clone())
    }

    fn insert(&self, table: &str, routing_key: &str, endpoints: Vec<Endpoint>) {
        self.map
            .insert((table.to_owned(), routing_key.to_owned()), Arc::new(endpoints));
    }

    fn clear(&self) {
        self.map.clear();
    }
}

/// Computes the ordered natural endpoint list for a token.
pub trait ReplicationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn replication_factor(&self, table: &str) -> Result<usize, ConfigurationError>;

    /// Pure placement computation against an explicit ring snapshot; the
    /// ring controller uses it for hypothetical topologies.
    fn calculate_natural_endpoints(
        &self,
        token: &Token,
        ring: &RingState,
        table: &str,
    ) -> Result<Vec<Endpoint>, ConfigurationError>;

    /// The part of the search token that determines placement, used as the
    /// memo key. `None` disables caching for this lookup.
    fn routing_key(&self, token: &Token, ring: &RingState) -> Option<String>;

    fn cache(&self) -> &EndpointCache;

    /// Memoizing wrapper around [`Self::calculate_natural_endpoints`].
    fn get_natural_endpoints(
        &self,
        token: &Token,
        ring: &RingState,
        table: &str,
    ) -> Result<Vec<Endpoint>, ConfigurationError> {
        let Some(routing_key) = self.routing_key(token, ring) else {
            return self.calculate_natural_endpoints(token, ring, table);
        };
        if let Some(cached) = self.cache().get(table, &routing_key) {
            return Ok((*cached).clone());
        }
        let endpoints = self.calculate_natural_endpoints(token, ring, table)?;
        self.cache().insert(table, &routing_key, endpoints.clone());
        Ok(endpoints)
    }

    /// Drops every memoized replica list. Must run on every ring mutation.
    fn clear_endpoint_cache(&self);

    /// The ranges each endpoint replicates, over the whole ring.
    fn get_address_ranges(
        &self,
        ring: &RingState,
        table: &str,
    ) -> Result<HashMap<Endpoint, Vec<Range>>, ConfigurationError> {
        let mut map: HashMap<Endpoint, Vec<Range>> = HashMap::new();
        for token in ring.sorted_tokens() {
            let Some(left) = ring.predecessor(token) else {
                continue;
            };
            let range = Range::new(left.clone(), token.clone());
            for endpoint in self.calculate_natural_endpoints(token, ring, table)? {
                map.entry(endpoint).or_default().push(range.clone());
            }
        }
        Ok(map)
    }

    /// The endpoints replicating each range; the inverse view of
    /// [`Self::get_address_ranges`].
    fn get_range_addresses(
        &self,
        ring: &RingState,
        table: &str,
    ) -> Result<HashMap<Range, Vec<Endpoint>>, ConfigurationError> {
        let mut map: HashMap<Range, Vec<Endpoint>> = HashMap::new();
        for token in ring.sorted_tokens() {
            let Some(left) = ring.predecessor(token) else {
                continue;
            };
            let range = Range::new(left.clone(), token.clone());
            map.insert(range, self.calculate_natural_endpoints(token, ring, table)?);
        }
        Ok(map)
    }
}

/// Successive distinct endpoints clockwise from the key's token.
pub struct SimpleStrategy {
    config: Arc<Config>,
    cache: EndpointCache,
}

impl SimpleStrategy {
    pub fn new(config: Arc<Config>) -> Self {
        SimpleStrategy {
            config,
            cache: EndpointCache::default(),
        }
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Simple
    }

    fn replication_factor(&self, table: &str) -> Result<usize, ConfigurationError> {
        self.config.replication_factor(table)
    }

    fn calculate_natural_endpoints(
        &self,
        token: &Token,
        ring: &RingState,
        table: &str,
    ) -> Result<Vec<Endpoint>, ConfigurationError> {
        let replicas = self.config.replication_factor(table)?;
        Ok(ring
            .ring_iter(token)
            .map(|(_, endpoint)| endpoint)
            .unique()
            .take(replicas)
            .collect())
    }

    fn routing_key(&self, token: &Token, ring: &RingState) -> Option<String> {
        RingState::first_token(ring.sorted_tokens(), token).map(|t| t.as_str().to_owned())
    }

    fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    fn clear_endpoint_cache(&self) {
        self.cache.clear();
    }
}

/// The bit permutation deriving the next replica's domain from the current
/// one: an 8-bit rotate-right-by-one, with four hard-coded fixed points that
/// would otherwise sit in degenerate rotation cycles. The special cases are
/// load-bearing for on-disk and placement compatibility; do not touch them.
pub(crate) fn shuffle(domain: u8) -> u8 {
    match domain {
        0x00 => 0x55,
        0x55 => 0xff,
        0xaa => 0x00,
        0xff => 0xaa,
        _ => (domain >> 1) | ((domain & 1) << 7),
    }
}

/// Deterministic per-request backup pick when the primary replica is down or
/// latency-excluded. Successive `try_count` values land on distinct backup
/// replicas, and the double shuffle spreads the retry load across endpoints
/// rather than racks.
pub fn choose_backup_endpoint(
    partition: u8,
    endpoints: &[Option<Endpoint>],
    try_count: usize,
) -> Option<Endpoint> {
    if endpoints.len() < 2 {
        return None;
    }
    let spread = shuffle(shuffle(partition)) as usize;
    let mut cycle = 0;
    loop {
        cycle += 1;
        if cycle >= endpoints.len() {
            return None;
        }
        let index = (cycle + try_count + spread) % (endpoints.len() - 1);
        if let Some(endpoint) = endpoints[1 + index] {
            return Some(endpoint);
        }
    }
}

/// Even replica distribution with a rack-diversity guarantee.
///
/// Requires the number of distinct racks to equal the replication factor of
/// every table it serves. Replica 0 comes off the full ring; each further
/// replica comes off the sub-ring of one still-unused rack, searched with
/// the key token re-prefixed by the shuffled domain.
pub struct RackAwareOdklEvenStrategy {
    config: Arc<Config>,
    snitch: Arc<dyn Snitch>,
    partitioner: OdklDomainPartitioner,
    cache: EndpointCache,
}

impl std::fmt::Debug for RackAwareOdklEvenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RackAwareOdklEvenStrategy")
            .field("config", &self.config)
            .field("partitioner", &self.partitioner)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl RackAwareOdklEvenStrategy {
    pub fn new(config: Arc<Config>, snitch: Arc<dyn Snitch>) -> Result<Self, ConfigurationError> {
        let strategy = RackAwareOdklEvenStrategy {
            config,
            snitch,
            partitioner: OdklDomainPartitioner,
            cache: EndpointCache::default(),
        };
        strategy.validate()?;
        Ok(strategy)
    }

    /// With a statically configured rack set, every rack-aware table's
    /// replication factor must match it up front.
    fn validate(&self) -> Result<(), ConfigurationError> {
        let Some(racks) = self.snitch.configured_racks() else {
            return Ok(());
        };
        info!("rack aware placement (re)configuring with known racks: {racks:?}");
        for (table, table_config) in self.config.tables() {
            if table_config.strategy != StrategyKind::RackAwareOdklEven {
                continue;
            }
            if table_config.replication_factor != racks.len() {
                return Err(ConfigurationError::RacksDontMatchReplicationFactor {
                    table: table.clone(),
                    racks: racks.len(),
                    replication_factor: table_config.replication_factor,
                });
            }
        }
        Ok(())
    }

    /// The racks participating in the ring: the configured set when the
    /// snitch has one, otherwise the racks observed on ring members.
    fn ring_racks(&self, ring: &RingState) -> BTreeSet<String> {
        if let Some(racks) = self.snitch.configured_racks() {
            return racks;
        }
        ring.sorted_tokens()
            .iter()
            .filter_map(|t| ring.endpoint(t))
            .map(|endpoint| self.snitch.rack(&endpoint))
            .collect()
    }

    /// The sub-ring of one rack: all tokens whose owner lives in it.
    fn replica_tokens(&self, ring: &RingState, rack: &str) -> Vec<Token> {
        ring.sorted_tokens()
            .iter()
            .filter(|t| {
                ring.endpoint(t)
                    .is_some_and(|endpoint| self.snitch.rack(&endpoint) == rack)
            })
            .cloned()
            .collect()
    }

    pub fn rack(&self, endpoint: &Endpoint) -> String {
        self.snitch.rack(endpoint)
    }
}

impl ReplicationStrategy for RackAwareOdklEvenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RackAwareOdklEven
    }

    fn replication_factor(&self, table: &str) -> Result<usize, ConfigurationError> {
        self.config.replication_factor(table)
    }

    fn calculate_natural_endpoints(
        &self,
        token: &Token,
        ring: &RingState,
        table: &str,
    ) -> Result<Vec<Endpoint>, ConfigurationError> {
        let replicas = self.config.replication_factor(table)?;
        let mut endpoints = Vec::with_capacity(replicas);
        if ring.sorted_tokens().is_empty() {
            return Ok(endpoints);
        }

        let mut tokens: Vec<Token> = ring.sorted_tokens().to_vec();
        let mut racks = self.ring_racks(ring);
        let mut key_token = token.clone();

        loop {
            let ring_token = RingState::first_token(&tokens, &key_token).ok_or_else(|| {
                ConfigurationError::InvalidToken("replica sub-ring is empty".into())
            })?;
            let endpoint = ring.endpoint(ring_token).ok_or_else(|| {
                ConfigurationError::InvalidToken(format!("ring token {ring_token} has no owner"))
            })?;
            endpoints.push(endpoint);
            racks.remove(&self.snitch.rack(&endpoint));

            if endpoints.len() >= replicas {
                break;
            }

            let domain = self.partitioner.domain_of(&key_token)?;
            key_token = self
                .partitioner
                .to_string_token(shuffle(domain), key_token.as_str());

            let Some(rack) = racks.iter().next().cloned() else {
                return Err(ConfigurationError::RacksDontMatchReplicationFactor {
                    table: table.to_owned(),
                    racks: endpoints.len(),
                    replication_factor: replicas,
                });
            };
            tokens = self.replica_tokens(ring, &rack);
            if tokens.is_empty() {
                return Err(ConfigurationError::EmptyRack(rack));
            }
        }

        Ok(endpoints)
    }

    fn routing_key(&self, token: &Token, ring: &RingState) -> Option<String> {
        // placement depends on the primary ring position and the domain the
        // shuffle chain starts from
        let first = RingState::first_token(ring.sorted_tokens(), token)?;
        let domain = self.partitioner.domain_of(token).ok()?;
        Some(format!("{domain:02x}|{first}"))
    }

    fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    fn clear_endpoint_cache(&self) {
        self.cache.clear();
    }
}
