//! Mock collaborators shared by the coordinator and controller tests: an
//! in-memory cluster whose transport routes requests straight into
//! per-endpoint stores.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::db::{row_digest, ColumnFamily, Row, RowMutation};
use crate::errors::{StoreError, TransportError};
use crate::net::{Message, ReadCommand, ReadResponse, StreamRequest, Transport, Verb};
use crate::routing::{Endpoint, Range, Token};
use crate::service::{
    FailureDetector, Gossiper, LocalStore, NoopStats, ServerContext, Snitch,
};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Endpoint `127.0.0.n:9160`.
pub(crate) fn ep(n: u8) -> Endpoint {
    SocketAddr::from(([127, 0, 0, n], 9160))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---- snitch ---------------------------------------------------------------

pub(crate) struct MockSnitch {
    racks: HashMap<Endpoint, String>,
}

impl MockSnitch {
    pub(crate) fn with_racks(racks: &[(Endpoint, &str)]) -> Self {
        MockSnitch {
            racks: racks
                .iter()
                .map(|(endpoint, rack)| (*endpoint, (*rack).to_owned()))
                .collect(),
        }
    }
}

impl Snitch for MockSnitch {
    fn rack(&self, endpoint: &Endpoint) -> String {
        self.racks
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| "UNKNOWN".to_owned())
    }

    fn datacenter(&self, _endpoint: &Endpoint) -> String {
        "DC1".to_owned()
    }

    fn sort_by_proximity(&self, relative_to: &Endpoint, endpoints: &mut Vec<Endpoint>) {
        let home_rack = self.rack(relative_to);
        let reference = *relative_to;
        endpoints.sort_by_key(|endpoint| {
            (
                *endpoint != reference,
                self.rack(endpoint) != home_rack,
                *endpoint,
            )
        });
    }

    fn configured_racks(&self) -> Option<BTreeSet<String>> {
        Some(self.racks.values().cloned().collect())
    }
}

// ---- failure detector -----------------------------------------------------

#[derive(Default)]
pub(crate) struct MockFailureDetector {
    down: Mutex<HashSet<Endpoint>>,
}

impl MockFailureDetector {
    pub(crate) fn mark_down(&self, endpoint: Endpoint) {
        lock(&self.down).insert(endpoint);
    }

    pub(crate) fn mark_up(&self, endpoint: Endpoint) {
        lock(&self.down).remove(&endpoint);
    }
}

impl FailureDetector for MockFailureDetector {
    fn is_alive(&self, endpoint: &Endpoint) -> bool {
        !lock(&self.down).contains(endpoint)
    }
}

// ---- gossiper -------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockGossiper {
    pub(crate) states: Mutex<Vec<(String, String)>>,
    pub(crate) removed: Mutex<Vec<Endpoint>>,
    pub(crate) replaced: Mutex<Vec<Endpoint>>,
    generations: Mutex<HashMap<Endpoint, i64>>,
    loads: Mutex<HashMap<Endpoint, f64>>,
    live: Mutex<HashSet<Endpoint>>,
    stopped: AtomicBool,
}

impl MockGossiper {
    pub(crate) fn set_generation(&self, endpoint: Endpoint, generation: i64) {
        lock(&self.generations).insert(endpoint, generation);
    }

    pub(crate) fn set_load(&self, endpoint: Endpoint, load: f64) {
        lock(&self.loads).insert(endpoint, load);
    }

    pub(crate) fn set_live(&self, endpoints: &[Endpoint]) {
        *lock(&self.live) = endpoints.iter().copied().collect();
    }

    pub(crate) fn last_state(&self, key: &str) -> Option<String> {
        lock(&self.states)
            .iter()
            .rev()
            .find(|(state_key, _)| state_key == key)
            .map(|(_, value)| value.clone())
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::Acquire)
    }
}

impl Gossiper for MockGossiper {
    fn get_live_members(&self) -> Vec<Endpoint> {
        lock(&self.live).iter().copied().collect()
    }

    fn get_dead_members(&self) -> Vec<Endpoint> {
        Vec::new()
    }

    fn update_timestamp(&self, _endpoint: Endpoint) {}

    fn add_local_application_state(&self, key: &str, value: &str) {
        lock(&self.states).push((key.to_owned(), value.to_owned()));
    }

    fn compare_endpoint_startup(&self, a: &Endpoint, b: &Endpoint) -> Ordering {
        let generations = lock(&self.generations);
        let left = generations.get(a).copied().unwrap_or(0);
        let right = generations.get(b).copied().unwrap_or(0);
        left.cmp(&right)
    }

    fn replaced_endpoint(&self, endpoint: Endpoint) {
        lock(&self.replaced).push(endpoint);
    }

    fn remove_endpoint(&self, endpoint: Endpoint) {
        lock(&self.removed).push(endpoint);
    }

    fn endpoint_load(&self, endpoint: &Endpoint) -> Option<f64> {
        lock(&self.loads).get(endpoint).copied()
    }

    fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Release);
    }

    fn start(&self) {
        self.stopped.store(false, AtomicOrdering::Release);
    }
}

// ---- local store ----------------------------------------------------------

#[derive(Default)]
pub(crate) struct MemLocalStore {
    data: Mutex<HashMap<(String, String), ColumnFamily>>,
    splits: Mutex<Vec<Token>>,
    pub(crate) flushes: AtomicUsize,
    pub(crate) commit_log_rolls: AtomicUsize,
    pub(crate) compactions: AtomicUsize,
}

impl MemLocalStore {
    pub(crate) fn get(&self, table: &str, key: &str) -> Option<ColumnFamily> {
        lock(&self.data)
            .get(&(table.to_owned(), key.to_owned()))
            .cloned()
    }

    pub(crate) fn put(&self, table: &str, key: &str, cf: ColumnFamily) {
        lock(&self.data).insert((table.to_owned(), key.to_owned()), cf);
    }

    pub(crate) fn set_splits(&self, splits: Vec<Token>) {
        *lock(&self.splits) = splits;
    }
}

#[async_trait]
impl LocalStore for MemLocalStore {
    async fn apply(&self, mutation: &RowMutation) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        data.entry((mutation.table.clone(), mutation.key.clone()))
            .or_default()
            .resolve(&mutation.columns);
        Ok(())
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<ColumnFamily>, StoreError> {
        Ok(self.get(table, key))
    }

    async fn flush(&self, _table: &str, _column_families: &[String]) -> Result<(), StoreError> {
        self.flushes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.flushes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn roll_commit_log(&self) -> Result<(), StoreError> {
        self.commit_log_rolls.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn force_compaction(
        &self,
        _table: &str,
        _column_families: &[String],
    ) -> Result<(), StoreError> {
        self.compactions.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn sample_splits(&self, range: &Range, _keys_per_split: usize) -> Vec<Token> {
        let configured = lock(&self.splits);
        if !configured.is_empty() {
            return configured
                .iter()
                .filter(|token| range.contains(token))
                .cloned()
                .collect();
        }
        // fall back to the stored keys themselves as split points
        let mut tokens: Vec<Token> = lock(&self.data)
            .keys()
            .map(|(_, key)| Token::new(key.clone()))
            .filter(|token| range.contains(token))
            .collect();
        tokens.sort();
        tokens
    }
}

// ---- transport ------------------------------------------------------------

/// Routes messages straight into per-endpoint in-memory stores.
///
/// Endpoints in the failure detector's down set fail sends immediately;
/// endpoints in the `silent` set accept sends but never respond, which is
/// how the timeout paths are exercised.
pub(crate) struct ClusterTransport {
    stores: Mutex<HashMap<Endpoint, Arc<MemLocalStore>>>,
    failure_detector: Arc<MockFailureDetector>,
    silent: Mutex<HashSet<Endpoint>>,
    pub(crate) one_way_log: Mutex<Vec<(Endpoint, Verb)>>,
    pub(crate) stream_log: Mutex<Vec<(Endpoint, StreamRequest)>>,
    bootstrap_tokens: Mutex<HashMap<Endpoint, String>>,
}

impl ClusterTransport {
    pub(crate) fn new(failure_detector: Arc<MockFailureDetector>) -> Arc<Self> {
        Arc::new(ClusterTransport {
            stores: Mutex::new(HashMap::new()),
            failure_detector,
            silent: Mutex::new(HashSet::new()),
            one_way_log: Mutex::new(Vec::new()),
            stream_log: Mutex::new(Vec::new()),
            bootstrap_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn add_node(&self, endpoint: Endpoint) -> Arc<MemLocalStore> {
        let store = Arc::new(MemLocalStore::default());
        lock(&self.stores).insert(endpoint, store.clone());
        store
    }

    pub(crate) fn store(&self, endpoint: &Endpoint) -> Arc<MemLocalStore> {
        lock(&self.stores)
            .get(endpoint)
            .cloned()
            .expect("no store registered for endpoint")
    }

    pub(crate) fn set_silent(&self, endpoint: Endpoint) {
        lock(&self.silent).insert(endpoint);
    }

    pub(crate) fn set_bootstrap_token_reply(&self, endpoint: Endpoint, token: &str) {
        lock(&self.bootstrap_tokens).insert(endpoint, token.to_owned());
    }

    pub(crate) fn one_way_count(&self, endpoint: Endpoint, verb: Verb) -> usize {
        lock(&self.one_way_log)
            .iter()
            .filter(|(to, v)| *to == endpoint && *v == verb)
            .count()
    }

    async fn respond(&self, message: Message, to: Endpoint) -> Result<Message, TransportError> {
        let reply_body = match message.verb {
            Verb::Read => {
                let command = ReadCommand::deserialize(&message.body)
                    .map_err(TransportError::Malformed)?;
                let cf = self.store(&to).get(&command.table, &command.key);
                let response = if command.digest {
                    ReadResponse::Digest(Bytes::copy_from_slice(&row_digest(cf.as_ref())))
                } else {
                    ReadResponse::Data(Row {
                        key: command.key,
                        cf,
                    })
                };
                return Ok(Message::new(Verb::ReadResponse, to, response.serialize()));
            }
            Verb::Mutation => {
                let mutation = RowMutation::deserialize(&message.body)
                    .map_err(TransportError::Malformed)?;
                self.store(&to)
                    .apply(&mutation)
                    .await
                    .map_err(|e| TransportError::SendFailed {
                        to,
                        reason: e.to_string(),
                    })?;
                Bytes::new()
            }
            Verb::StreamInitiate | Verb::StreamRequest => {
                let request = StreamRequest::deserialize(&message.body)
                    .map_err(TransportError::Malformed)?;
                lock(&self.stream_log).push((to, request));
                return Ok(Message::new(Verb::StreamFinished, to, Bytes::new()));
            }
            Verb::BootstrapToken => {
                let token = lock(&self.bootstrap_tokens)
                    .get(&to)
                    .cloned()
                    .unwrap_or_default();
                Bytes::from(token.into_bytes())
            }
            other => {
                return Err(TransportError::SendFailed {
                    to,
                    reason: format!("unhandled verb {other:?}"),
                })
            }
        };
        Ok(Message::new(message.verb, to, reply_body))
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    fn send_one_way(&self, message: Message, to: Endpoint) {
        lock(&self.one_way_log).push((to, message.verb));
        if !self.failure_detector.is_alive(&to) {
            return;
        }
        match message.verb {
            Verb::Mutation | Verb::ReadRepair => {
                if let Ok(mutation) = RowMutation::deserialize(&message.body) {
                    let store = self.store(&to);
                    let mut data = lock(&store.data);
                    data.entry((mutation.table.clone(), mutation.key.clone()))
                        .or_default()
                        .resolve(&mutation.columns);
                }
            }
            Verb::StreamRequest => {
                if let Ok(request) = StreamRequest::deserialize(&message.body) {
                    lock(&self.stream_log).push((to, request));
                }
            }
            _ => {}
        }
    }

    async fn send_rr(&self, message: Message, to: Endpoint) -> Result<Message, TransportError> {
        if !self.failure_detector.is_alive(&to) {
            return Err(TransportError::SendFailed {
                to,
                reason: "endpoint is down".to_owned(),
            });
        }
        if lock(&self.silent).contains(&to) {
            return futures::future::pending().await;
        }
        self.respond(message, to).await
    }
}

// ---- whole-cluster fixture ------------------------------------------------

pub(crate) struct TestCluster {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) transport: Arc<ClusterTransport>,
    pub(crate) failure_detector: Arc<MockFailureDetector>,
    pub(crate) gossiper: Arc<MockGossiper>,
    _data_dir: tempfile::TempDir,
}

impl TestCluster {
    /// Builds a context over mock collaborators; every endpoint in `racks`
    /// gets its own in-memory store.
    pub(crate) fn build(config: Config, racks: &[(Endpoint, &str)]) -> TestCluster {
        Self::build_with_stats(config, racks, Arc::new(NoopStats))
    }

    pub(crate) fn build_with_stats(
        mut config: Config,
        racks: &[(Endpoint, &str)],
        stats: Arc<dyn crate::service::StatsSink>,
    ) -> TestCluster {
        setup_tracing();
        let data_dir = tempfile::tempdir().expect("tempdir");
        config.data_dir = data_dir.path().to_path_buf();

        let failure_detector = Arc::new(MockFailureDetector::default());
        let transport = ClusterTransport::new(failure_detector.clone());
        for (endpoint, _) in racks {
            transport.add_node(*endpoint);
        }
        if !racks.iter().any(|(e, _)| *e == config.listen_address) {
            transport.add_node(config.listen_address);
        }
        let local_store = transport.store(&config.listen_address);
        let gossiper = Arc::new(MockGossiper::default());
        let snitch = Arc::new(MockSnitch::with_racks(racks));

        let ctx = Arc::new(
            ServerContext::new(
                Arc::new(config),
                transport.clone(),
                gossiper.clone(),
                failure_detector.clone(),
                snitch,
                local_store,
                stats,
            )
            .expect("context construction"),
        );

        TestCluster {
            ctx,
            transport,
            failure_detector,
            gossiper,
            _data_dir: data_dir,
        }
    }

    pub(crate) fn populate_ring(&self, entries: &[(&str, Endpoint)]) {
        for (token, endpoint) in entries {
            self.ctx
                .token_metadata
                .update_normal_token(Token::new(*token), *endpoint);
        }
    }
}
