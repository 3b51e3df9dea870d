//! The ring membership state machine.
//!
//! Gossip delivers `MOVE` application-state changes for remote endpoints;
//! this controller folds them into [`TokenMetadata`], recomputes pending
//! ranges after every topology mutation, and drives the local node's own
//! lifecycle: bootstrap, move, decommission, token removal and drain.
//!
//! Pending-range math deliberately over-approximates. Writes sent to a node
//! that ultimately does not take the range are cleaned up later; writes
//! missed during movement cannot be.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cluster::token_metadata::{PendingRangeMap, TokenMetadata};
use crate::coordinator::hints::HintedHandoffManager;
use crate::errors::{ConfigurationError, FatalError, RingError, TransportError};
use crate::net::move_state::{self, MoveValue};
use crate::net::{Message, StreamRequest, Verb};
use crate::routing::locator::ReplicationStrategy;
use crate::routing::{Endpoint, Range, Token};
use crate::service::system::{SystemRecord, SystemStore};
use crate::service::ServerContext;

/// What the node is currently doing, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Starting,
    Joining,
    Normal,
    Leaving,
    Decommissioned,
    Draining,
    Drained,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationMode::Starting => "Starting",
            OperationMode::Joining => "Joining",
            OperationMode::Normal => "Normal",
            OperationMode::Leaving => "Leaving",
            OperationMode::Decommissioned => "Decommissioned",
            OperationMode::Draining => "Draining",
            OperationMode::Drained => "Drained",
        };
        f.write_str(name)
    }
}

pub struct RingController {
    ctx: Arc<ServerContext>,
    hints: Arc<HintedHandoffManager>,
    system: SystemStore,
    record: Mutex<SystemRecord>,
    mode: Mutex<OperationMode>,
    bootstrap_resume: Notify,
}

impl RingController {
    /// Opens the system record and verifies the cluster name; a mismatch is
    /// fatal and the process should exit.
    pub fn new(
        ctx: Arc<ServerContext>,
        hints: Arc<HintedHandoffManager>,
    ) -> Result<Arc<Self>, FatalError> {
        let system = SystemStore::open(&ctx.config.data_dir)?;
        let record = system.initialize(&ctx.config.cluster_name)?;
        info!(
            "system record loaded: generation {}, bootstrapped {}",
            record.generation, record.bootstrapped
        );
        Ok(Arc::new(RingController {
            ctx,
            hints,
            system,
            record: Mutex::new(record),
            mode: Mutex::new(OperationMode::Starting),
            bootstrap_resume: Notify::new(),
        }))
    }

    fn record(&self) -> std::sync::MutexGuard<'_, SystemRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn operation_mode(&self) -> OperationMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: OperationMode, log: bool) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        if log {
            info!("{mode}");
        }
    }

    pub fn generation(&self) -> i64 {
        self.record().generation
    }

    pub fn local_token(&self) -> Option<Token> {
        self.record().token.clone()
    }

    fn local_endpoint(&self) -> Endpoint {
        self.ctx.local_endpoint()
    }

    /// Every ring mutation invalidates the replica caches and recomputes
    /// pending ranges.
    fn ring_mutated(&self) {
        self.ctx.clear_endpoint_caches();
        self.calculate_pending_ranges();
    }

    fn gossip_move(&self, value: &MoveValue) {
        self.ctx
            .gossiper
            .add_local_application_state(move_state::MOVE_STATE, &move_state::format(value));
    }

    // ---- startup ----------------------------------------------------------

    /// Joins the ring. A node that completed bootstrap before (or was given
    /// a token by the operator and already owns it) rejoins immediately;
    /// anything else bootstraps first, streaming its ranges in.
    pub async fn start(&self, token_hint: Option<Token>) -> Result<(), RingError> {
        let (bootstrapped, saved_token) = {
            let record = self.record();
            (record.bootstrapped, record.token.clone())
        };

        if bootstrapped {
            let token = saved_token.ok_or_else(|| {
                FatalError::InvalidBootState("bootstrapped but no saved token".into())
            })?;
            self.ctx
                .token_metadata
                .update_normal_token(token.clone(), self.local_endpoint());
            self.ring_mutated();
            self.gossip_move(&MoveValue::Normal {
                token: self.ctx.partitioner.token_to_string(&token),
                removed_token: None,
            });
            self.set_mode(OperationMode::Normal, true);
            return Ok(());
        }

        let token = match token_hint.or(saved_token) {
            Some(token) => token,
            None => self.ctx.partitioner.random_token(),
        };
        self.ctx
            .partitioner
            .validate_token(&token)
            .map_err(RingError::from)?;
        self.bootstrap(token).await
    }

    /// The full bootstrap sequence: announce, wait for pending ranges to
    /// propagate, stream data in, then join the ring as a normal member.
    async fn bootstrap(&self, token: Token) -> Result<(), RingError> {
        {
            let mut record = self.record();
            // not set_token: the node must not look like a ring member until
            // bootstrap completes
            self.system.update_token(&mut record, token.clone())?;
        }
        self.gossip_move(&MoveValue::Bootstrapping {
            token: self.ctx.partitioner.token_to_string(&token),
        });
        self.set_mode(OperationMode::Joining, false);
        info!(
            "Joining: sleeping {:?} for pending range setup",
            self.ctx.config.ring_delay
        );
        sleep(self.ctx.config.ring_delay).await;

        self.stream_in_bootstrap_ranges(&token).await?;

        if self.ctx.config.manual_bootstrap_resume {
            info!(
                "bootstrap data retrieval completed; waiting for operator \
                 resume before joining the ring"
            );
            self.bootstrap_resume.notified().await;
        }

        {
            let mut record = self.record();
            self.system.set_bootstrapped(&mut record, true)?;
        }
        self.ctx
            .token_metadata
            .update_normal_token(token.clone(), self.local_endpoint());
        self.ring_mutated();
        self.gossip_move(&MoveValue::Normal {
            token: self.ctx.partitioner.token_to_string(&token),
            removed_token: None,
        });
        info!("bootstrap/move completed; now serving reads");
        self.set_mode(OperationMode::Normal, false);
        Ok(())
    }

    /// Releases a bootstrap held by `manual_bootstrap_resume`.
    pub fn resume_bootstrap(&self) {
        self.bootstrap_resume.notify_one();
    }

    /// Asks the current owners of our future ranges to stream them to us.
    async fn stream_in_bootstrap_ranges(&self, token: &Token) -> Result<(), RingError> {
        let ring = self.ctx.token_metadata.snapshot();
        if ring.sorted_tokens().is_empty() {
            // first node in the cluster; nothing to stream
            return Ok(());
        }
        for table in self.ctx.config.table_names() {
            let strategy = self.ctx.strategy(&table)?;
            let mut future_ring = (*ring).clone();
            future_ring.update_normal_token(token.clone(), self.local_endpoint());
            let my_ranges = strategy
                .get_address_ranges(&future_ring, &table)?
                .remove(&self.local_endpoint())
                .unwrap_or_default();

            let sources = strategy.get_range_addresses(&ring, &table)?;
            let mut requests = Vec::new();
            for range in my_ranges {
                // closest live current replica of the range becomes the source
                let Some(mut owners) = sources
                    .iter()
                    .find(|(source_range, _)| {
                        source_range.contains(&range.right) || *source_range == &range
                    })
                    .map(|(_, owners)| owners.clone())
                else {
                    continue;
                };
                self.ctx
                    .snitch
                    .sort_by_proximity(&self.local_endpoint(), &mut owners);
                let Some(source) = owners
                    .into_iter()
                    .find(|owner| self.ctx.failure_detector.is_alive(owner))
                else {
                    continue;
                };
                let body = StreamRequest {
                    table: table.clone(),
                    range,
                }
                .serialize();
                let message = Message::new(Verb::StreamRequest, self.local_endpoint(), body);
                let transport = self.ctx.transport.clone();
                requests.push(async move { transport.send_rr(message, source).await });
            }
            for result in join_all(requests).await {
                result.map_err(RingError::Transport)?;
            }
        }
        Ok(())
    }

    // ---- gossip state machine ---------------------------------------------

    /// Entry point for gossip state changes of remote endpoints.
    ///
    /// Normal state progression of a node:
    /// `BOOT,token` while receiving files, `NORMAL,token` once serving,
    /// `LEAVING,token` while handing ranges off, `LEFT,token` when gone.
    /// `NORMAL,token,remove,token2` is a normal node proxying a dead node's
    /// token removal.
    pub fn on_change(&self, endpoint: Endpoint, state_name: &str, state_value: &str) {
        if state_name != move_state::MOVE_STATE {
            return;
        }
        if endpoint == self.local_endpoint() {
            return;
        }
        let value = match move_state::parse(state_value) {
            Ok(value) => value,
            Err(e) => {
                warn!("ignoring malformed MOVE state from {endpoint}: {e}");
                return;
            }
        };
        match value {
            MoveValue::Bootstrapping { token } => {
                self.handle_state_bootstrap(endpoint, self.parse_token(&token))
            }
            MoveValue::Normal {
                token,
                removed_token,
            } => self.handle_state_normal(
                endpoint,
                self.parse_token(&token),
                removed_token.map(|t| self.parse_token(&t)),
            ),
            MoveValue::Leaving { token } => {
                self.handle_state_leaving(endpoint, self.parse_token(&token))
            }
            MoveValue::Left { token } => self.handle_state_left(endpoint, self.parse_token(&token)),
            MoveValue::Hibernate => {
                // held down while a replacement boots with the same token
                debug!("node {endpoint} is hibernating");
            }
        }
    }

    fn parse_token(&self, raw: &str) -> Token {
        self.ctx.partitioner.token_from_string(raw)
    }

    fn handle_state_bootstrap(&self, endpoint: Endpoint, token: Token) {
        debug!("node {endpoint} state bootstrapping, token {token}");
        let ring = self.ctx.token_metadata.snapshot();
        if ring.is_member(&endpoint) {
            // either we missed intermediate states or the node crashed and
            // is restarting; a missed LEFT alone is common enough not to log
            if !ring.is_leaving(&endpoint) {
                info!("node {endpoint} state jump to bootstrap");
            }
            self.ctx.token_metadata.remove_endpoint(endpoint);
        }
        self.ctx.token_metadata.add_bootstrap_token(token, endpoint);
        self.ring_mutated();
    }

    fn handle_state_normal(&self, endpoint: Endpoint, token: Token, removed: Option<Token>) {
        debug!("node {endpoint} state normal, token {token}");
        if self.ctx.token_metadata.is_member(&endpoint) {
            info!("node {endpoint} state jump to normal");
        }

        match self.ctx.token_metadata.endpoint(&token) {
            None => {
                debug!("new node {endpoint} at token {token}");
                self.ctx
                    .token_metadata
                    .update_normal_token(token.clone(), endpoint);
            }
            Some(current) if current == endpoint => {}
            Some(current) => {
                // two nodes advertise the same token: the younger gossip
                // generation wins, the loser is marked replaced
                if self
                    .ctx
                    .gossiper
                    .compare_endpoint_startup(&endpoint, &current)
                    .is_gt()
                {
                    info!(
                        "nodes {endpoint} and {current} have the same token {token}; \
                         {endpoint} is the new owner"
                    );
                    self.ctx
                        .token_metadata
                        .update_normal_token(token.clone(), endpoint);
                    self.ctx.gossiper.replaced_endpoint(current);
                } else {
                    info!(
                        "nodes {endpoint} and {current} have the same token {token}; \
                         ignoring {endpoint}"
                    );
                    self.ctx.gossiper.replaced_endpoint(endpoint);
                }
            }
        }

        if let Some(token_that_left) = removed {
            // removetoken was run against a dead node; this endpoint proxies
            let endpoint_that_left = self.ctx.token_metadata.endpoint(&token_that_left);
            if endpoint_that_left == Some(self.local_endpoint()) {
                info!(
                    "received removetoken gossip about myself; is this node a \
                     replacement for a removed one?"
                );
                return;
            }
            debug!(
                "token {token_that_left} removed manually (endpoint was {:?})",
                endpoint_that_left
            );
            if let Some(left) = endpoint_that_left {
                self.restore_replica_count(&left);
                self.ctx.gossiper.remove_endpoint(left);
                self.ctx.token_metadata.remove_endpoint(left);
            }
            self.ctx.token_metadata.remove_bootstrap_token(&token_that_left);
        }

        self.ring_mutated();
    }

    fn handle_state_leaving(&self, endpoint: Endpoint, token: Token) {
        debug!("node {endpoint} state leaving, token {token}");
        let ring = self.ctx.token_metadata.snapshot();
        // if the node was unknown or its token does not match, register it
        // as normal first so pending ranges come out right
        if !ring.is_member(&endpoint) {
            info!("node {endpoint} state jump to leaving");
            self.ctx
                .token_metadata
                .update_normal_token(token.clone(), endpoint);
        } else if ring.token(&endpoint) != Some(&token) {
            warn!("node {endpoint} 'leaving' token mismatch; long network partition?");
            self.ctx
                .token_metadata
                .update_normal_token(token.clone(), endpoint);
        }
        self.ctx.token_metadata.add_leaving_endpoint(endpoint);
        self.ring_mutated();
    }

    fn handle_state_left(&self, endpoint: Endpoint, token: Token) {
        debug!("node {endpoint} state left, token {token}");
        let ring = self.ctx.token_metadata.snapshot();
        if ring.is_member(&endpoint) {
            if ring.token(&endpoint) != Some(&token) {
                warn!("node {endpoint} 'left' token mismatch; long network partition?");
            }
            self.ctx.token_metadata.remove_endpoint(endpoint);
        }
        self.ctx.token_metadata.remove_bootstrap_token(&token);
        self.ring_mutated();
    }

    /// Called when the failure detector reports an endpoint up; kicks the
    /// hint replay for it.
    pub fn on_endpoint_alive(&self, endpoint: Endpoint) {
        self.ctx.gossiper.update_timestamp(endpoint);
        self.hints.on_endpoint_alive(endpoint);
    }

    // ---- pending ranges ---------------------------------------------------

    fn calculate_pending_ranges(&self) {
        for table in self.ctx.config.table_names() {
            let strategy = match self.ctx.strategy(&table) {
                Ok(strategy) => strategy,
                Err(e) => {
                    warn!("no strategy for table {table}: {e}");
                    continue;
                }
            };
            if let Err(e) = Self::calculate_pending_ranges_for(
                strategy.as_ref(),
                &self.ctx.token_metadata,
                &table,
            ) {
                warn!("pending range calculation for {table} failed: {e}");
            }
        }
    }

    /// Recomputes the pending ranges of one table.
    ///
    /// Leaves first: with all leaving nodes stripped from the ring, any
    /// endpoint that newly appears in a leaving-owned range's replica list
    /// is pending for it. Then bootstraps: each bootstrapping node is added
    /// to the stripped ring alone, its ranges marked pending, and removed
    /// again — overlapping bootstraps over-approximate, which is the safe
    /// direction.
    pub fn calculate_pending_ranges_for(
        strategy: &dyn ReplicationStrategy,
        token_metadata: &TokenMetadata,
        table: &str,
    ) -> Result<(), ConfigurationError> {
        let ring = token_metadata.snapshot();
        let bootstrap_tokens = ring.bootstrap_tokens();
        let leaving = ring.leaving_endpoints();

        if bootstrap_tokens.is_empty() && leaving.is_empty() {
            debug!("no bootstrapping or leaving nodes, no pending ranges for {table}");
            token_metadata.set_pending_ranges(table, PendingRangeMap::new());
            return Ok(());
        }

        let mut pending = PendingRangeMap::new();
        let address_ranges = strategy.get_address_ranges(&ring, table)?;
        let all_left = ring.clone_after_all_left();

        let affected_ranges: HashSet<Range> = leaving
            .iter()
            .flat_map(|endpoint| {
                address_ranges
                    .get(endpoint)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        for range in affected_ranges {
            let current = strategy.calculate_natural_endpoints(&range.right, &ring, table)?;
            let next = strategy.calculate_natural_endpoints(&range.right, &all_left, table)?;
            for endpoint in next {
                if !current.contains(&endpoint) {
                    pending.entry(range.clone()).or_default().insert(endpoint);
                }
            }
        }

        let mut scratch = all_left;
        for (token, endpoint) in bootstrap_tokens {
            scratch.update_normal_token(token.clone(), *endpoint);
            let ranges = strategy
                .get_address_ranges(&scratch, table)?
                .remove(endpoint)
                .unwrap_or_default();
            for range in ranges {
                pending.entry(range).or_default().insert(*endpoint);
            }
            scratch.remove_endpoint(*endpoint);
        }

        debug!("pending ranges for {table}: {pending:?}");
        token_metadata.set_pending_ranges(table, pending);
        Ok(())
    }

    // ---- replica restoration ----------------------------------------------

    /// Ranges that change ownership when `endpoint` leaves: for each range
    /// it replicates, the endpoints that would newly appear in the replica
    /// list once it is gone.
    fn changed_ranges_for_leaving(
        &self,
        table: &str,
        endpoint: &Endpoint,
    ) -> Result<HashMap<Range, Vec<Endpoint>>, ConfigurationError> {
        let ring = self.ctx.token_metadata.snapshot();
        let strategy = self.ctx.strategy(table)?;

        let ranges = strategy
            .get_address_ranges(&ring, table)?
            .remove(endpoint)
            .unwrap_or_default();
        debug!("node {endpoint} ranges {ranges:?}");

        let mut without = ring.clone_after_all_left();
        if without.is_member(endpoint) {
            without.remove_endpoint(*endpoint);
        }

        let mut changed: HashMap<Range, Vec<Endpoint>> = HashMap::new();
        for range in ranges {
            let current = strategy.calculate_natural_endpoints(&range.right, &ring, table)?;
            let next = strategy.calculate_natural_endpoints(&range.right, &without, table)?;
            let gained: Vec<Endpoint> = next
                .into_iter()
                .filter(|e| !current.contains(e))
                .collect();
            if !gained.is_empty() {
                changed.insert(range, gained);
            }
        }
        Ok(changed)
    }

    /// After an unexpected removal, figure out which ranges this node newly
    /// replicates and ask the nearest live holder of each to stream it over.
    fn restore_replica_count(&self, removed: &Endpoint) {
        let local = self.local_endpoint();
        for table in self.ctx.config.table_names() {
            let changed = match self.changed_ranges_for_leaving(&table, removed) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!("cannot compute changed ranges for {table}: {e}");
                    continue;
                }
            };
            let my_new_ranges: Vec<Range> = changed
                .iter()
                .filter(|(_, endpoints)| endpoints.contains(&local))
                .map(|(range, _)| range.clone())
                .collect();
            if my_new_ranges.is_empty() {
                continue;
            }
            debug!("{removed} was removed, my added ranges: {my_new_ranges:?}");

            let ring = self.ctx.token_metadata.snapshot();
            let strategy = match self.ctx.strategy(&table) {
                Ok(strategy) => strategy,
                Err(_) => continue,
            };
            let range_addresses = match strategy.get_range_addresses(&ring, &table) {
                Ok(map) => map,
                Err(e) => {
                    warn!("cannot compute range addresses for {table}: {e}");
                    continue;
                }
            };

            for range in my_new_ranges {
                let mut sources = range_addresses.get(&range).cloned().unwrap_or_default();
                self.ctx.snitch.sort_by_proximity(&local, &mut sources);
                debug_assert!(!sources.contains(&local));
                let Some(source) = sources
                    .into_iter()
                    .filter(|s| s != removed)
                    .find(|s| self.ctx.failure_detector.is_alive(s))
                else {
                    warn!("no live source for range {range} of {table}");
                    continue;
                };
                debug!("requesting range {range} of {table} from {source}");
                let body = StreamRequest {
                    table: table.clone(),
                    range,
                }
                .serialize();
                self.ctx.transport.send_one_way(
                    Message::new(Verb::StreamRequest, local, body),
                    source,
                );
            }
        }
    }

    // ---- local lifecycle operations ---------------------------------------

    fn start_leaving(&self) -> Result<(), RingError> {
        let token = self.local_token().ok_or(RingError::NotAMember)?;
        self.gossip_move(&MoveValue::Leaving {
            token: self.ctx.partitioner.token_to_string(&token),
        });
        self.ctx
            .token_metadata
            .add_leaving_endpoint(self.local_endpoint());
        self.ring_mutated();
        Ok(())
    }

    fn ensure_no_inbound_movement(&self) -> Result<(), RingError> {
        let ring = self.ctx.token_metadata.snapshot();
        for table in self.ctx.config.table_names() {
            if !ring
                .pending_ranges_for_endpoint(&table, &self.local_endpoint())
                .is_empty()
            {
                return Err(RingError::PendingMovement);
            }
        }
        Ok(())
    }

    /// Streams every range this node is responsible for to whoever takes it
    /// over, blocking until each transfer is acknowledged.
    async fn unbootstrap(&self) -> Result<(), RingError> {
        for table in self.ctx.config.table_names() {
            let changed = self
                .changed_ranges_for_leaving(&table, &self.local_endpoint())
                .map_err(RingError::from)?;
            if changed.is_empty() {
                continue;
            }
            self.set_mode(OperationMode::Leaving, false);
            info!("leaving: streaming {table} data to other nodes");
            let mut transfers = Vec::new();
            for (range, new_owners) in changed {
                for owner in new_owners {
                    let body = StreamRequest {
                        table: table.clone(),
                        range: range.clone(),
                    }
                    .serialize();
                    let message =
                        Message::new(Verb::StreamInitiate, self.local_endpoint(), body);
                    let transport = self.ctx.transport.clone();
                    transfers.push(async move { transport.send_rr(message, owner).await });
                }
            }
            debug!("waiting for stream acks");
            for result in join_all(transfers).await {
                result.map_err(RingError::Transport)?;
            }
            debug!("stream acks all received");
        }
        Ok(())
    }

    async fn leave_ring(&self) -> Result<(), RingError> {
        let token = self.local_token().ok_or(RingError::NotAMember)?;
        {
            let mut record = self.record();
            self.system.set_bootstrapped(&mut record, false)?;
        }
        self.ctx
            .token_metadata
            .remove_endpoint(self.local_endpoint());
        self.ring_mutated();
        self.gossip_move(&MoveValue::Left {
            token: self.ctx.partitioner.token_to_string(&token),
        });
        // let the LEFT state spread before tearing anything down
        sleep(self.ctx.config.gossip_settle).await;
        Ok(())
    }

    /// Orderly departure: announce LEAVING, wait out the ring delay, hand
    /// every owned range off, then leave and quiesce.
    pub async fn decommission(&self) -> Result<(), RingError> {
        let ring = self.ctx.token_metadata.snapshot();
        if !ring.is_member(&self.local_endpoint()) {
            return Err(RingError::NotAMember);
        }
        if ring.clone_after_all_left().sorted_tokens().len() < 2 {
            return Err(RingError::NoOtherMembers);
        }
        self.ensure_no_inbound_movement()?;

        debug!("DECOMMISSIONING");
        self.start_leaving()?;
        info!(
            "leaving: sleeping {:?} for pending range setup",
            self.ctx.config.ring_delay
        );
        sleep(self.ctx.config.ring_delay).await;

        self.unbootstrap().await?;
        self.leave_ring().await?;
        self.ctx.gossiper.stop();
        self.set_mode(OperationMode::Decommissioned, true);
        Ok(())
    }

    /// Moves this node to `new_token`, or to a load-balanced position when
    /// none is given: the ring leaves at the old token, then bootstraps at
    /// the new one.
    pub async fn move_token(&self, new_token: Option<Token>) -> Result<(), RingError> {
        self.ensure_no_inbound_movement()?;
        if let Some(token) = &new_token {
            if self.ctx.token_metadata.endpoint(token).is_some() {
                return Err(RingError::TokenAlreadyOwned(token.as_str().to_owned()));
            }
        }

        debug!("leaving: old token was {:?}", self.local_token());
        self.start_leaving()?;
        info!(
            "leaving: sleeping {:?} for pending range setup",
            self.ctx.config.ring_delay
        );
        sleep(self.ctx.config.ring_delay).await;

        self.unbootstrap().await?;
        self.leave_ring().await?;

        let target = match new_token {
            Some(token) => token,
            None => self.balanced_token().await?,
        };
        {
            let mut record = self.record();
            record.bootstrapped = false;
            self.system.save(&record)?;
        }
        self.bootstrap(target).await
    }

    /// `move` without a target: pick the most loaded node and split its
    /// primary range in half.
    pub async fn load_balance(&self) -> Result<(), RingError> {
        self.move_token(None).await
    }

    /// Asks the most loaded live node for a token splitting its range.
    async fn balanced_token(&self) -> Result<Token, RingError> {
        let local = self.local_endpoint();
        let loaded = self
            .ctx
            .gossiper
            .get_live_members()
            .into_iter()
            .filter(|endpoint| *endpoint != local)
            .filter_map(|endpoint| {
                self.ctx
                    .gossiper
                    .endpoint_load(&endpoint)
                    .map(|load| (endpoint, load))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let Some((endpoint, load)) = loaded else {
            return Err(RingError::NoOtherMembers);
        };
        debug!("requesting bootstrap token from {endpoint} (load {load})");
        let reply = self
            .ctx
            .transport
            .send_rr(
                Message::new(Verb::BootstrapToken, local, bytes::Bytes::new()),
                endpoint,
            )
            .await
            .map_err(RingError::Transport)?;
        let raw = std::str::from_utf8(&reply.body).map_err(|_| {
            RingError::Transport(TransportError::Malformed(
                crate::errors::CodecError::InvalidUtf8,
            ))
        })?;
        Ok(self.ctx.partitioner.token_from_string(raw))
    }

    /// A token that splits this node's primary range roughly in half:
    /// the median sampled key, or the arithmetic midpoint when the range is
    /// sparsely populated. This is what a `BootstrapToken` request returns.
    pub fn local_bootstrap_token(&self) -> Result<Token, RingError> {
        let ring = self.ctx.token_metadata.snapshot();
        let range = ring
            .primary_range(&self.local_endpoint())
            .ok_or(RingError::NotAMember)?;
        let sampled = self.ctx.store.sample_splits(&range, 1);
        if sampled.len() < 3 {
            Ok(self.ctx.partitioner.midpoint(&range.left, &range.right))
        } else {
            Ok(sampled[sampled.len() / 2].clone())
        }
    }

    /// Evicts a dead node's token from the ring on the operator's behalf,
    /// restoring replica counts and gossiping the removal.
    pub fn remove_token(&self, token: &Token) -> Result<(), RingError> {
        let endpoint = self
            .ctx
            .token_metadata
            .endpoint(token)
            .ok_or_else(|| RingError::UnknownToken(token.as_str().to_owned()))?;
        if endpoint == self.local_endpoint() {
            return Err(RingError::RemovingSelf);
        }
        let local_token = self.local_token().ok_or(RingError::NotAMember)?;

        self.restore_replica_count(&endpoint);
        self.ctx.gossiper.remove_endpoint(endpoint);
        self.ctx.token_metadata.remove_endpoint(endpoint);
        self.ring_mutated();

        // becomes this node's permanent gossip state until it coordinates
        // another removal
        self.gossip_move(&MoveValue::Normal {
            token: self.ctx.partitioner.token_to_string(&local_token),
            removed_token: Some(self.ctx.partitioner.token_to_string(token)),
        });
        Ok(())
    }

    /// Quiesces the mutation stage, flushes memtables and rolls a fresh
    /// commit-log segment. Irreversible without a restart.
    pub async fn drain(&self) -> Result<(), RingError> {
        let mode = self.operation_mode();
        if matches!(mode, OperationMode::Draining | OperationMode::Drained) {
            return Err(RingError::InvalidState(mode.to_string()));
        }
        self.set_mode(OperationMode::Draining, true);
        self.ctx.disable_mutations();
        self.ctx.store.flush_all().await?;
        self.ctx.store.roll_commit_log().await?;
        self.set_mode(OperationMode::Drained, true);
        Ok(())
    }

    /// The ring as operators see it: sorted tokens with their owners.
    pub fn ring_view(&self) -> Vec<(Token, Endpoint)> {
        let ring = self.ctx.token_metadata.snapshot();
        ring.sorted_tokens()
            .iter()
            .filter_map(|token| ring.endpoint(token).map(|ep| (token.clone(), ep)))
            .collect()
    }
}
