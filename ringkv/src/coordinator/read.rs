//! The per-key read coordinator.
//!
//! One replica (the closest by snitch proximity) is asked for full data,
//! the rest of the quorum for digests only. If any digest disagrees with
//! the data, the request is re-issued as full data to every participant
//! and the versions are merged; replicas holding stale versions receive a
//! fire-and-forget repair mutation carrying exactly what they are missing.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::coordinator::ConsistencyLevel;
use crate::db::{row_digest, ColumnFamily, Row, RowMutation};
use crate::errors::{DigestMismatchError, ReadError, UnavailableError};
use crate::net::{Message, ReadCommand, ReadResponse, Verb};
use crate::routing::Endpoint;
use crate::service::ServerContext;

/// Turns read responses into a resolved row, verifying digests and setting
/// up repairs as necessary.
///
/// Responses are keyed by responder endpoint; inserts are idempotent, and a
/// response landing after the handler has returned to the client has no
/// external effect (the resolver is dropped with the request).
pub(crate) struct ReadResponseResolver {
    key: String,
    responses: HashMap<Endpoint, ReadResponse>,
}

/// A resolved read plus the repairs it implies.
pub(crate) struct Resolved {
    pub(crate) row: Row,
    pub(crate) repairs: Vec<(Endpoint, ColumnFamily)>,
}

impl ReadResponseResolver {
    pub(crate) fn new(key: &str) -> Self {
        ReadResponseResolver {
            key: key.to_owned(),
            responses: HashMap::new(),
        }
    }

    pub(crate) fn preprocess(&mut self, from: Endpoint, response: ReadResponse) {
        self.responses.insert(from, response);
    }

    pub(crate) fn response_count(&self) -> usize {
        self.responses.len()
    }

    /// True once at least one full-data response arrived.
    pub(crate) fn is_data_present(&self) -> bool {
        self.responses.values().any(|r| !r.is_digest())
    }

    /// Merges every data version into the superset row, first verifying
    /// that all digests agree with each other and with every data version.
    pub(crate) fn resolve(&self) -> Result<Resolved, DigestMismatchError> {
        let mut versions: Vec<(Endpoint, Option<&ColumnFamily>)> = Vec::new();
        let mut digest: Option<&[u8]> = None;

        for (endpoint, response) in &self.responses {
            match response {
                ReadResponse::Digest(bytes) => match digest {
                    None => digest = Some(&bytes[..]),
                    Some(first) if first != &bytes[..] => {
                        return Err(DigestMismatchError {
                            key: self.key.clone(),
                            digest1: first.to_vec(),
                            digest2: bytes.to_vec(),
                        });
                    }
                    Some(_) => {}
                },
                ReadResponse::Data(row) => versions.push((*endpoint, row.cf.as_ref())),
            }
        }

        if let Some(digest) = digest {
            for (_, version) in &versions {
                let data_digest = row_digest(*version);
                if digest != &data_digest[..] {
                    return Err(DigestMismatchError {
                        key: self.key.clone(),
                        digest1: digest.to_vec(),
                        digest2: data_digest.to_vec(),
                    });
                }
            }
            trace!("digests verified for key {}", self.key);
        }

        let resolved = ColumnFamily::resolve_superset(versions.iter().map(|(_, v)| *v));

        // every version missing part of the superset gets a repair with
        // exactly the difference
        let mut repairs = Vec::new();
        if let Some(resolved_cf) = &resolved {
            for (endpoint, version) in &versions {
                let diff = match version {
                    Some(version) => version.diff(resolved_cf),
                    None if !resolved_cf.is_empty() => Some(resolved_cf.clone()),
                    None => None,
                };
                if let Some(diff) = diff {
                    repairs.push((*endpoint, diff));
                }
            }
        }

        Ok(Resolved {
            row: Row {
                key: self.key.clone(),
                cf: resolved,
            },
            repairs,
        })
    }
}

/// Coordinates reads for keys this node fronts, at any consistency level.
pub struct ReadCoordinator {
    ctx: Arc<ServerContext>,
    consistency_checks: Option<mpsc::Sender<(String, String)>>,
}

impl ReadCoordinator {
    /// Spawns the weak-read consistency worker pool; must be called inside
    /// a runtime.
    pub fn new(ctx: Arc<ServerContext>) -> Arc<Self> {
        let consistency_checks = if ctx.config.consistency_workers > 0 {
            Some(spawn_consistency_workers(&ctx))
        } else {
            None
        };
        Arc::new(ReadCoordinator {
            ctx,
            consistency_checks,
        })
    }

    /// Reads one row, blocking for `consistency`-many replica responses.
    pub async fn read(
        &self,
        table: &str,
        key: &str,
        consistency: ConsistencyLevel,
    ) -> Result<Row, ReadError> {
        let ctx = &self.ctx;
        let ring = ctx.token_metadata.snapshot();
        let token = ctx.partitioner.get_token(key);
        let strategy = ctx.strategy(table)?;
        let replication_factor = strategy.replication_factor(table)?;
        let block_for = consistency.block_for(replication_factor).max(1);

        let natural = strategy.get_natural_endpoints(&token, &ring, table)?;
        let mut live: Vec<Endpoint> = natural
            .iter()
            .copied()
            .filter(|e| ctx.failure_detector.is_alive(e))
            .collect();
        if live.len() < block_for {
            return Err(UnavailableError {
                required: block_for,
                alive: live.len(),
            }
            .into());
        }
        ctx.snitch
            .sort_by_proximity(&ctx.local_endpoint(), &mut live);
        let targets = &live[..block_for];

        let resolved = match self.read_round(table, key, targets, false).await {
            Ok(resolved) => resolved,
            Err(ReadError::DigestMismatch(mismatch)) => {
                // one replica is stale; ask everyone for full data and merge
                debug!("digest mismatch on {key}: {mismatch}; retrying with full data");
                self.read_round(table, key, targets, true).await?
            }
            Err(e) => return Err(e),
        };

        self.schedule_repairs(table, key, &resolved);

        // weak reads get their full-replica-set check in the background
        if consistency == ConsistencyLevel::One && replication_factor > 1 {
            if let Some(checks) = &self.consistency_checks {
                if checks.try_send((table.to_owned(), key.to_owned())).is_err() {
                    debug!("consistency check queue full; skipping {table}/{key}");
                }
            }
        }

        Ok(resolved.row)
    }

    /// One dispatch round: full data from the first target, digests (or
    /// data on the retry pass) from the rest, resolved once `targets.len()`
    /// responses are in.
    async fn read_round(
        &self,
        table: &str,
        key: &str,
        targets: &[Endpoint],
        all_data: bool,
    ) -> Result<Resolved, ReadError> {
        let ctx = &self.ctx;
        let required = targets.len();
        let deadline = Instant::now() + ctx.config.rpc_timeout;
        let mut resolver = ReadResponseResolver::new(key);

        let mut in_flight = FuturesUnordered::new();
        for (i, endpoint) in targets.iter().enumerate() {
            let command = ReadCommand {
                table: table.to_owned(),
                key: key.to_owned(),
                digest: !all_data && i != 0,
            };
            let message = Message::new(Verb::Read, ctx.local_endpoint(), command.serialize());
            let transport = ctx.transport.clone();
            let endpoint = *endpoint;
            in_flight.push(async move { (endpoint, transport.send_rr(message, endpoint).await) });
        }

        while resolver.response_count() < required || !resolver.is_data_present() {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some((endpoint, Ok(reply)))) => match ReadResponse::deserialize(&reply.body) {
                    Ok(response) => resolver.preprocess(endpoint, response),
                    Err(e) => warn!("malformed read response from {endpoint}: {e}"),
                },
                Ok(Some((endpoint, Err(e)))) => debug!("read from {endpoint} failed: {e}"),
            }
        }

        if resolver.response_count() < required || !resolver.is_data_present() {
            return Err(ReadError::Timeout {
                received: resolver.response_count(),
                required,
            });
        }

        resolver.resolve().map_err(ReadError::from)
    }

    /// Sends each stale replica the columns it is missing, one way. Repairs
    /// never block the client reply.
    fn schedule_repairs(&self, table: &str, key: &str, resolved: &Resolved) {
        for (endpoint, diff) in &resolved.repairs {
            let mutation = RowMutation::with_columns(table, key, diff.clone());
            let message = Message::new(
                Verb::ReadRepair,
                self.ctx.local_endpoint(),
                mutation.serialize(),
            );
            self.ctx.transport.send_one_way(message, *endpoint);
            self.ctx.stats.read_repair_scheduled();
        }
    }
}

/// Bounded worker pool draining asynchronous consistency checks issued for
/// weak reads: read the full replica set, merge, repair. Failures are
/// logged and dropped; the next weak read re-triggers.
fn spawn_consistency_workers(ctx: &Arc<ServerContext>) -> mpsc::Sender<(String, String)> {
    let (tx, rx) = mpsc::channel::<(String, String)>(128);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..ctx.config.consistency_workers {
        let rx = rx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some((table, key)) = next else {
                    return;
                };
                if let Err(e) = check_consistency(&ctx, &table, &key).await {
                    debug!("consistency check for {table}/{key} failed: {e}");
                }
            }
        });
    }
    tx
}

/// Reads every live replica with full data, merges and repairs stragglers.
async fn check_consistency(
    ctx: &Arc<ServerContext>,
    table: &str,
    key: &str,
) -> Result<(), ReadError> {
    let ring = ctx.token_metadata.snapshot();
    let token = ctx.partitioner.get_token(key);
    let strategy = ctx.strategy(table)?;
    let live: Vec<Endpoint> = strategy
        .get_natural_endpoints(&token, &ring, table)?
        .into_iter()
        .filter(|e| ctx.failure_detector.is_alive(e))
        .collect();
    if live.len() < 2 {
        return Ok(());
    }

    let deadline = Instant::now() + ctx.config.rpc_timeout;
    let mut resolver = ReadResponseResolver::new(key);
    let mut in_flight = FuturesUnordered::new();
    for endpoint in &live {
        let command = ReadCommand {
            table: table.to_owned(),
            key: key.to_owned(),
            digest: false,
        };
        let message = Message::new(Verb::Read, ctx.local_endpoint(), command.serialize());
        let transport = ctx.transport.clone();
        let endpoint = *endpoint;
        in_flight.push(async move { (endpoint, transport.send_rr(message, endpoint).await) });
    }
    loop {
        match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some((endpoint, Ok(reply)))) => {
                if let Ok(response) = ReadResponse::deserialize(&reply.body) {
                    resolver.preprocess(endpoint, response);
                }
            }
            Ok(Some((endpoint, Err(e)))) => debug!("consistency read from {endpoint} failed: {e}"),
        }
    }

    if !resolver.is_data_present() {
        return Ok(());
    }
    let resolved = resolver.resolve().map_err(ReadError::from)?;
    for (endpoint, diff) in &resolved.repairs {
        let mutation = RowMutation::with_columns(table, key, diff.clone());
        let message = Message::new(Verb::ReadRepair, ctx.local_endpoint(), mutation.serialize());
        ctx.transport.send_one_way(message, *endpoint);
        ctx.stats.read_repair_scheduled();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Column;
    use bytes::Bytes;
    use crate::utils::test_utils::ep;

    fn cf(cols: &[(&str, &str, i64)]) -> ColumnFamily {
        let mut cf = ColumnFamily::new();
        for &(name, value, ts) in cols {
            cf.insert(name, Column::live(value.as_bytes().to_vec(), ts));
        }
        cf
    }

    fn data(cf_value: Option<ColumnFamily>) -> ReadResponse {
        ReadResponse::Data(Row {
            key: "k".into(),
            cf: cf_value,
        })
    }

    #[test]
    fn resolve_single_version_is_identity() {
        let version = cf(&[("c1", "x", 10)]);
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(version.clone())));
        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.row.cf, Some(version));
        assert!(resolved.repairs.is_empty());
    }

    #[test]
    fn resolve_is_order_independent() {
        let v1 = cf(&[("c1", "x", 10)]);
        let v2 = cf(&[("c1", "x", 10), ("c2", "y", 5)]);

        let mut forward = ReadResponseResolver::new("k");
        forward.preprocess(ep(1), data(Some(v1.clone())));
        forward.preprocess(ep(2), data(Some(v2.clone())));

        let mut backward = ReadResponseResolver::new("k");
        backward.preprocess(ep(2), data(Some(v2)));
        backward.preprocess(ep(1), data(Some(v1)));

        assert_eq!(
            forward.resolve().unwrap().row,
            backward.resolve().unwrap().row
        );
    }

    #[test]
    fn resolve_with_resolved_version_is_stable() {
        let v1 = cf(&[("c1", "x", 10)]);
        let v2 = cf(&[("c2", "y", 5)]);
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(v1.clone())));
        resolver.preprocess(ep(2), data(Some(v2.clone())));
        let resolved = resolver.resolve().unwrap();

        let mut with_resolved = ReadResponseResolver::new("k");
        with_resolved.preprocess(ep(1), data(Some(v1)));
        with_resolved.preprocess(ep(2), data(Some(v2)));
        with_resolved.preprocess(ep(3), data(resolved.row.cf.clone()));
        assert_eq!(with_resolved.resolve().unwrap().row, resolved.row);
    }

    /// Replicas missing a column are scheduled for repair; the complete
    /// replica is not.
    #[test]
    fn repairs_target_only_stale_replicas() {
        let stale = cf(&[("c1", "x", 10)]);
        let complete = cf(&[("c1", "x", 10), ("c2", "y", 5)]);

        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(stale.clone())));
        resolver.preprocess(ep(2), data(Some(complete.clone())));
        resolver.preprocess(ep(3), data(Some(stale)));

        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.row.cf, Some(complete));

        let mut repaired: Vec<Endpoint> =
            resolved.repairs.iter().map(|(e, _)| *e).collect();
        repaired.sort();
        assert_eq!(repaired, vec![ep(1), ep(3)]);
        for (_, diff) in &resolved.repairs {
            assert_eq!(diff.len(), 1);
            assert!(diff.column("c2").is_some());
        }
    }

    #[test]
    fn digest_disagreement_raises_mismatch() {
        let version = cf(&[("c1", "x", 10)]);
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(version)));
        resolver.preprocess(
            ep(2),
            ReadResponse::Digest(Bytes::from_static(b"not-the-digest!!")),
        );
        assert!(resolver.resolve().is_err());
    }

    #[test]
    fn matching_digest_passes() {
        let version = cf(&[("c1", "x", 10)]);
        let digest = Bytes::copy_from_slice(&row_digest(Some(&version)));
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(version.clone())));
        resolver.preprocess(ep(2), ReadResponse::Digest(digest));
        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.row.cf, Some(version));
        assert!(resolved.repairs.is_empty());
    }

    #[test]
    fn replica_without_row_gets_full_repair() {
        let version = cf(&[("c1", "x", 10)]);
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(version.clone())));
        resolver.preprocess(ep(2), data(None));
        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved.repairs.len(), 1);
        assert_eq!(resolved.repairs[0].0, ep(2));
        assert_eq!(resolved.repairs[0].1, version);
    }

    #[test]
    fn late_duplicate_responses_are_idempotent() {
        let version = cf(&[("c1", "x", 10)]);
        let mut resolver = ReadResponseResolver::new("k");
        resolver.preprocess(ep(1), data(Some(version.clone())));
        resolver.preprocess(ep(1), data(Some(version)));
        assert_eq!(resolver.response_count(), 1);
    }
}
