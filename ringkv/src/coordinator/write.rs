//! The per-key write coordinator.
//!
//! A mutation is serialized exactly once; the same bytes go to live
//! replicas, into the hint log for dead or unresponsive ones, and to
//! pending endpoints of in-motion ranges. The client blocks until the
//! consistency level's worth of acknowledgements arrive. Timed-out writes
//! are not rolled back; hinted handoff and read repair converge them.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::debug;

use crate::coordinator::hints::HintedHandoffManager;
use crate::coordinator::ConsistencyLevel;
use crate::db::RowMutation;
use crate::errors::{UnavailableError, WriteError};
use crate::net::{Message, Verb};
use crate::routing::Endpoint;
use crate::service::ServerContext;

pub struct WriteCoordinator {
    ctx: Arc<ServerContext>,
    hints: Arc<HintedHandoffManager>,
}

impl WriteCoordinator {
    pub fn new(ctx: Arc<ServerContext>, hints: Arc<HintedHandoffManager>) -> Self {
        WriteCoordinator { ctx, hints }
    }

    /// Applies one mutation at the requested consistency level.
    pub async fn mutate(
        &self,
        mutation: &RowMutation,
        consistency: ConsistencyLevel,
    ) -> Result<(), WriteError> {
        let ctx = &self.ctx;
        if !ctx.mutations_enabled() {
            return Err(WriteError::Draining);
        }

        let serialized = mutation.serialize();
        let ring = ctx.token_metadata.snapshot();
        let token = ctx.partitioner.get_token(&mutation.key);
        let strategy = ctx.strategy(&mutation.table)?;
        let replication_factor = strategy.replication_factor(&mutation.table)?;
        let block_for = consistency.block_for(replication_factor);

        // natural endpoints plus anyone a pending range says must also see
        // this write while topology is in motion
        let mut targets = strategy.get_natural_endpoints(&token, &ring, &mutation.table)?;
        for pending in ring.pending_endpoints_for(&token, &mutation.table) {
            if !targets.contains(&pending) {
                targets.push(pending);
            }
        }

        let alive = targets
            .iter()
            .filter(|e| ctx.failure_detector.is_alive(e))
            .count();
        if alive < block_for {
            return Err(UnavailableError {
                required: block_for,
                alive,
            }
            .into());
        }

        let deadline = Instant::now() + ctx.config.rpc_timeout;
        let mut in_flight = FuturesUnordered::new();
        let mut hinted: HashSet<Endpoint> = HashSet::new();

        for endpoint in &targets {
            if !ctx.failure_detector.is_alive(endpoint) {
                self.hints.store_hint(*endpoint, &serialized);
                hinted.insert(*endpoint);
                continue;
            }
            let message = Message::new(Verb::Mutation, ctx.local_endpoint(), serialized.clone());
            let transport = ctx.transport.clone();
            let endpoint = *endpoint;
            in_flight.push(async move { (endpoint, transport.send_rr(message, endpoint).await) });
        }

        if block_for == 0 {
            // fire and forget; keep the sends alive in the background
            tokio::spawn(async move { while in_flight.next().await.is_some() {} });
            return Ok(());
        }

        let mut acked: HashSet<Endpoint> = HashSet::new();
        while acked.len() < block_for {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some((endpoint, Ok(_ack)))) => {
                    acked.insert(endpoint);
                }
                Ok(Some((endpoint, Err(e)))) => {
                    debug!("write to {endpoint} failed: {e}");
                    self.hints.store_hint(endpoint, &serialized);
                    hinted.insert(endpoint);
                }
            }
        }

        if acked.len() < block_for {
            // replicas we never heard from get hints before we surface the
            // timeout
            for endpoint in &targets {
                if !acked.contains(endpoint) && !hinted.contains(endpoint) {
                    self.hints.store_hint(*endpoint, &serialized);
                }
            }
            return Err(WriteError::Timeout {
                acks: acked.len(),
                required: block_for,
            });
        }

        Ok(())
    }
}
