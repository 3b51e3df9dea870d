//! Node and cluster configuration.
//!
//! A [`Config`] is built once at startup and shared read-only through the
//! [`crate::service::ServerContext`]; nothing in it changes while the node
//! runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigurationError;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Endpoint;

/// Replica placement flavor of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum StrategyKind {
    /// Successive distinct endpoints clockwise from the key's token.
    #[default]
    Simple,
    /// Per-rack sub-rings; requires exactly `replication_factor` racks.
    RackAwareOdklEven,
}

/// Per-table settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub replication_factor: usize,
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Name every member of the cluster must agree on; checked against the
    /// persisted system record at startup.
    pub cluster_name: String,
    /// Address this node participates in the ring under.
    pub listen_address: Endpoint,
    pub partitioner: PartitionerName,
    /// Deadline for one coordinated request round trip.
    pub rpc_timeout: Duration,
    /// How long topology changes are announced before data starts moving,
    /// giving pending ranges time to propagate.
    pub ring_delay: Duration,
    /// How long a final gossip state is given to spread before the node
    /// tears itself down.
    pub gossip_settle: Duration,
    /// Optional pause between replayed hints, to keep a recovering node
    /// from being flooded.
    pub hinted_handoff_throttle: Option<Duration>,
    /// Hold a finished bootstrap until the operator resumes it.
    pub manual_bootstrap_resume: bool,
    /// Worker count of the weak-read consistency pool.
    pub consistency_workers: usize,
    /// Where the system record and hint logs live.
    pub data_dir: PathBuf,
    tables: HashMap<String, TableConfig>,
}

impl Config {
    pub fn new(cluster_name: impl Into<String>, listen_address: Endpoint) -> Self {
        Config {
            cluster_name: cluster_name.into(),
            listen_address,
            partitioner: PartitionerName::default(),
            rpc_timeout: Duration::from_secs(10),
            ring_delay: Duration::from_secs(30),
            gossip_settle: Duration::from_secs(2),
            hinted_handoff_throttle: None,
            manual_bootstrap_resume: false,
            consistency_workers: 4,
            data_dir: PathBuf::from("data"),
            tables: HashMap::new(),
        }
    }

    /// Registers a non-system table.
    pub fn with_table(
        mut self,
        name: impl Into<String>,
        replication_factor: usize,
        strategy: StrategyKind,
    ) -> Self {
        self.tables.insert(
            name.into(),
            TableConfig {
                replication_factor,
                strategy,
            },
        );
        self
    }

    pub fn table(&self, name: &str) -> Result<&TableConfig, ConfigurationError> {
        self.tables
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownTable(name.to_owned()))
    }

    pub fn replication_factor(&self, table: &str) -> Result<usize, ConfigurationError> {
        Ok(self.table(table)?.replication_factor)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&String, &TableConfig)> {
        self.tables.iter()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn table_lookup() {
        let cfg = Config::new("Test Cluster", "127.0.0.1:7000".parse().unwrap())
            .with_table("users", 3, StrategyKind::RackAwareOdklEven);
        assert_eq!(cfg.replication_factor("users").unwrap(), 3);
        assert_matches!(
            cfg.table("nope"),
            Err(ConfigurationError::UnknownTable(name)) if name == "nope"
        );
    }
}
