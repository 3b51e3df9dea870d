//! The authoritative in-memory ring state.
//!
//! All mutations are serialized by a single write lock; readers never block.
//! Every mutation clones the current [`RingState`], applies itself and
//! atomically publishes the new snapshot, so a reader holding an `Arc` to a
//! snapshot observes a consistent ring no matter how the topology moves
//! underneath it. Callers must not cache tokens or endpoints across a ring
//! mutation unless they hold an explicit snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::warn;

use crate::routing::{Endpoint, Range, Token};

/// Ranges writes must additionally go to while topology is in motion,
/// per table.
pub type PendingRangeMap = HashMap<Range, BTreeSet<Endpoint>>;

/// One immutable snapshot of the ring.
///
/// Invariants:
/// - no token appears in both the normal and the bootstrap map,
/// - every leaving endpoint is a normal member,
/// - `sorted_tokens` is exactly the sorted key set of the normal map.
#[derive(Debug, Clone, Default)]
pub struct RingState {
    token_to_endpoint: BTreeMap<Token, Endpoint>,
    endpoint_to_token: HashMap<Endpoint, Token>,
    bootstrap_tokens: BTreeMap<Token, Endpoint>,
    leaving_endpoints: HashSet<Endpoint>,
    pending_ranges: HashMap<String, PendingRangeMap>,
    sorted_tokens: Vec<Token>,
}

impl RingState {
    fn rebuild_sorted(&mut self) {
        self.sorted_tokens = self.token_to_endpoint.keys().cloned().collect();
    }

    /// Inserts or moves the binding `(token, endpoint)`. Any previous
    /// binding of either side is removed in the same step, and the endpoint
    /// stops being bootstrapping or leaving.
    pub fn update_normal_token(&mut self, token: Token, endpoint: Endpoint) {
        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        self.bootstrap_tokens.remove(&token);

        if let Some(previous) = self.endpoint_to_token.remove(&endpoint) {
            self.token_to_endpoint.remove(&previous);
        }
        if let Some(previous_owner) = self.token_to_endpoint.remove(&token) {
            self.endpoint_to_token.remove(&previous_owner);
        }
        self.token_to_endpoint.insert(token.clone(), endpoint);
        self.endpoint_to_token.insert(endpoint, token);
        self.leaving_endpoints.remove(&endpoint);
        self.rebuild_sorted();
    }

    pub fn add_bootstrap_token(&mut self, token: Token, endpoint: Endpoint) {
        if let Some(owner) = self.token_to_endpoint.get(&token) {
            warn!(
                "bootstrap token {} already owned by normal member {}; ignoring",
                token, owner
            );
            return;
        }
        if let Some(other) = self.bootstrap_tokens.get(&token) {
            if *other != endpoint {
                warn!(
                    "bootstrap token {} already claimed by {}; now claimed by {}",
                    token, other, endpoint
                );
            }
        }
        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        self.bootstrap_tokens.insert(token, endpoint);
    }

    pub fn remove_bootstrap_token(&mut self, token: &Token) {
        self.bootstrap_tokens.remove(token);
    }

    pub fn add_leaving_endpoint(&mut self, endpoint: Endpoint) {
        debug_assert!(self.endpoint_to_token.contains_key(&endpoint));
        self.leaving_endpoints.insert(endpoint);
    }

    /// Removes every trace of the endpoint from the ring.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        if let Some(token) = self.endpoint_to_token.remove(&endpoint) {
            self.token_to_endpoint.remove(&token);
        }
        self.bootstrap_tokens.retain(|_, ep| *ep != endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.rebuild_sorted();
    }

    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.endpoint_to_token.contains_key(endpoint)
    }

    pub fn is_leaving(&self, endpoint: &Endpoint) -> bool {
        self.leaving_endpoints.contains(endpoint)
    }

    pub fn token(&self, endpoint: &Endpoint) -> Option<&Token> {
        self.endpoint_to_token.get(endpoint)
    }

    pub fn endpoint(&self, token: &Token) -> Option<Endpoint> {
        self.token_to_endpoint.get(token).copied()
    }

    pub fn sorted_tokens(&self) -> &[Token] {
        &self.sorted_tokens
    }

    pub fn bootstrap_tokens(&self) -> &BTreeMap<Token, Endpoint> {
        &self.bootstrap_tokens
    }

    pub fn leaving_endpoints(&self) -> &HashSet<Endpoint> {
        &self.leaving_endpoints
    }

    pub fn normal_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoint_to_token.keys()
    }

    /// Index into `sorted` of the smallest token ≥ `key`, wrapping to the
    /// front past the last token. `sorted` must not be empty.
    pub fn first_token_index(sorted: &[Token], key: &Token) -> usize {
        debug_assert!(!sorted.is_empty());
        match sorted.binary_search(key) {
            Ok(i) => i,
            Err(i) if i >= sorted.len() => 0,
            Err(i) => i,
        }
    }

    /// The smallest ring token ≥ `key`, wrapping at the end.
    pub fn first_token<'a>(sorted: &'a [Token], key: &Token) -> Option<&'a Token> {
        if sorted.is_empty() {
            return None;
        }
        Some(&sorted[Self::first_token_index(sorted, key)])
    }

    /// The ring member owning `key`'s token, if the ring is non-empty.
    pub fn closest_endpoint(&self, key: &Token) -> Option<Endpoint> {
        Self::first_token(&self.sorted_tokens, key).and_then(|t| self.endpoint(t))
    }

    /// The largest ring token < `token`, wrapping to the last token.
    pub fn predecessor(&self, token: &Token) -> Option<&Token> {
        let sorted = &self.sorted_tokens;
        if sorted.is_empty() {
            return None;
        }
        let i = match sorted.binary_search(token) {
            Ok(i) | Err(i) => i,
        };
        Some(&sorted[(i + sorted.len() - 1) % sorted.len()])
    }

    /// The smallest ring token > `token`, wrapping to the first token.
    pub fn successor(&self, token: &Token) -> Option<&Token> {
        let sorted = &self.sorted_tokens;
        if sorted.is_empty() {
            return None;
        }
        let i = match sorted.binary_search(token) {
            Ok(i) => (i + 1) % sorted.len(),
            Err(i) => i % sorted.len(),
        };
        Some(&sorted[i])
    }

    /// The arc the endpoint is the primary replica of:
    /// `(predecessor(token), token]`.
    pub fn primary_range(&self, endpoint: &Endpoint) -> Option<Range> {
        let token = self.token(endpoint)?;
        let left = self.predecessor(token)?;
        Some(Range::new(left.clone(), token.clone()))
    }

    /// Iterates the ring clockwise starting at the first token ≥ `start`,
    /// visiting each member exactly once. The order is deterministic for a
    /// given snapshot.
    pub fn ring_iter<'a>(
        &'a self,
        start: &Token,
    ) -> impl Iterator<Item = (&'a Token, Endpoint)> + 'a {
        let sorted = &self.sorted_tokens;
        let split = if sorted.is_empty() {
            0
        } else {
            Self::first_token_index(sorted, start)
        };
        sorted[split..]
            .iter()
            .chain(sorted[..split].iter())
            .filter_map(move |t| self.token_to_endpoint.get(t).map(|ep| (t, *ep)))
    }

    /// A projection of the ring with every leaving endpoint gone; only the
    /// normal token map survives into it. Used for pending-range math.
    pub fn clone_after_all_left(&self) -> RingState {
        let mut left = RingState::default();
        for (token, endpoint) in &self.token_to_endpoint {
            if !self.leaving_endpoints.contains(endpoint) {
                left.token_to_endpoint.insert(token.clone(), *endpoint);
                left.endpoint_to_token.insert(*endpoint, token.clone());
            }
        }
        left.rebuild_sorted();
        left
    }

    pub fn set_pending_ranges(&mut self, table: &str, ranges: PendingRangeMap) {
        if ranges.is_empty() {
            self.pending_ranges.remove(table);
        } else {
            self.pending_ranges.insert(table.to_owned(), ranges);
        }
    }

    pub fn pending_ranges(&self, table: &str) -> Option<&PendingRangeMap> {
        self.pending_ranges.get(table)
    }

    pub fn has_pending_ranges(&self) -> bool {
        !self.pending_ranges.is_empty()
    }

    /// Endpoints that must additionally receive a write to `token`.
    pub fn pending_endpoints_for(&self, token: &Token, table: &str) -> Vec<Endpoint> {
        let Some(ranges) = self.pending_ranges.get(table) else {
            return Vec::new();
        };
        let mut endpoints: Vec<Endpoint> = ranges
            .iter()
            .filter(|(range, _)| range.contains(token))
            .flat_map(|(_, eps)| eps.iter().copied())
            .collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }

    /// Ranges the endpoint is becoming responsible for in `table`.
    pub fn pending_ranges_for_endpoint(&self, table: &str, endpoint: &Endpoint) -> Vec<Range> {
        let Some(ranges) = self.pending_ranges.get(table) else {
            return Vec::new();
        };
        ranges
            .iter()
            .filter(|(_, eps)| eps.contains(endpoint))
            .map(|(range, _)| range.clone())
            .collect()
    }
}

/// Concurrent wrapper around [`RingState`]: one writer at a time, wait-free
/// snapshot reads.
#[derive(Debug, Default)]
pub struct TokenMetadata {
    state: ArcSwap<RingState>,
    write_lock: Mutex<()>,
}

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current ring snapshot. Holding it does not block writers.
    pub fn snapshot(&self) -> Arc<RingState> {
        self.state.load_full()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut RingState) -> R) -> R {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = (**self.state.load()).clone();
        let result = f(&mut next);
        self.state.store(Arc::new(next));
        result
    }

    pub fn update_normal_token(&self, token: Token, endpoint: Endpoint) {
        self.mutate(|s| s.update_normal_token(token, endpoint));
    }

    pub fn add_bootstrap_token(&self, token: Token, endpoint: Endpoint) {
        self.mutate(|s| s.add_bootstrap_token(token, endpoint));
    }

    pub fn remove_bootstrap_token(&self, token: &Token) {
        self.mutate(|s| s.remove_bootstrap_token(token));
    }

    pub fn add_leaving_endpoint(&self, endpoint: Endpoint) {
        self.mutate(|s| s.add_leaving_endpoint(endpoint));
    }

    pub fn remove_endpoint(&self, endpoint: Endpoint) {
        self.mutate(|s| s.remove_endpoint(endpoint));
    }

    pub fn set_pending_ranges(&self, table: &str, ranges: PendingRangeMap) {
        self.mutate(|s| s.set_pending_ranges(table, ranges));
    }

    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.snapshot().is_member(endpoint)
    }

    pub fn is_leaving(&self, endpoint: &Endpoint) -> bool {
        self.snapshot().is_leaving(endpoint)
    }

    pub fn token(&self, endpoint: &Endpoint) -> Option<Token> {
        self.snapshot().token(endpoint).cloned()
    }

    pub fn endpoint(&self, token: &Token) -> Option<Endpoint> {
        self.snapshot().endpoint(token)
    }

    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.snapshot().sorted_tokens().to_vec()
    }
}
