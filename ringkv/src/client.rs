//! Client-side ring cache.
//!
//! Smart clients keep a local `range → endpoints` table so they can route
//! requests to a replica directly instead of through an extra coordinator
//! hop. The cache is refreshed from a ring snapshot on demand (typically
//! after a routing miss or an `Unavailable` response) and reads never take
//! a lock on the live ring.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::cluster::RingState;
use crate::errors::ConfigurationError;
use crate::routing::locator::ReplicationStrategy;
use crate::routing::partitioner::Partitioner;
use crate::routing::{Endpoint, Range};

pub struct RingCache {
    table: String,
    partitioner: Arc<dyn Partitioner>,
    strategy: Arc<dyn ReplicationStrategy>,
    range_map: RwLock<Vec<(Range, Vec<Endpoint>)>>,
}

impl RingCache {
    pub fn new(
        table: impl Into<String>,
        partitioner: Arc<dyn Partitioner>,
        strategy: Arc<dyn ReplicationStrategy>,
    ) -> Self {
        RingCache {
            table: table.into(),
            partitioner,
            strategy,
            range_map: RwLock::new(Vec::new()),
        }
    }

    /// Rebuilds the cached table from a ring snapshot.
    pub fn refresh(&self, ring: &RingState) -> Result<(), ConfigurationError> {
        let mut ranges: Vec<(Range, Vec<Endpoint>)> = self
            .strategy
            .get_range_addresses(ring, &self.table)?
            .into_iter()
            .collect();
        ranges.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("ring cache for {} refreshed: {} ranges", self.table, ranges.len());
        *self
            .range_map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = ranges;
        Ok(())
    }

    /// The replica endpoints for a key, from the cached ring. Empty when
    /// the cache is stale or was never refreshed; refresh and retry then.
    pub fn endpoints_for(&self, key: &str) -> Vec<Endpoint> {
        let token = self.partitioner.get_token(key);
        let map = self
            .range_map
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.iter()
            .find(|(range, _)| range.contains(&token))
            .map(|(_, endpoints)| endpoints.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StrategyKind};
    use crate::routing::locator::SimpleStrategy;
    use crate::routing::partitioner::OrderPreservingPartitioner;
    use crate::routing::Token;
    use crate::utils::test_utils::ep;

    #[test]
    fn routes_keys_to_cached_replicas() {
        let config = Arc::new(
            Config::new("Test Cluster", "127.0.0.1:7000".parse().unwrap()).with_table(
                "users",
                2,
                StrategyKind::Simple,
            ),
        );
        let mut ring = RingState::default();
        ring.update_normal_token(Token::new("40"), ep(1));
        ring.update_normal_token(Token::new("80"), ep(2));
        ring.update_normal_token(Token::new("c0"), ep(3));

        let cache = RingCache::new(
            "users",
            Arc::new(OrderPreservingPartitioner),
            Arc::new(SimpleStrategy::new(config)),
        );
        assert!(cache.endpoints_for("50").is_empty());

        cache.refresh(&ring).unwrap();
        assert_eq!(cache.endpoints_for("50"), vec![ep(2), ep(3)]);
        assert_eq!(cache.endpoints_for("90"), vec![ep(3), ep(1)]);
        // wrapping arc
        assert_eq!(cache.endpoints_for("ff"), vec![ep(1), ep(2)]);
    }
}
