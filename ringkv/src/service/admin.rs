//! The management surface operator tooling talks to.
//!
//! Thin delegation: ring and node introspection come from the controller,
//! flush/compaction triggers go to the local store, lifecycle operations to
//! the ring controller. Exit-code policy lives in the CLI, not here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::cluster::{OperationMode, RingController};
use crate::errors::{ConfigurationError, RingError, StoreError};
use crate::routing::{Endpoint, Token};
use crate::service::ServerContext;

/// A point-in-time operator summary of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub token: Option<String>,
    pub operation_mode: String,
    pub generation: i64,
    pub live_members: usize,
    pub dead_members: usize,
}

pub struct AdminService {
    ctx: Arc<ServerContext>,
    controller: Arc<RingController>,
    compaction_threshold: Mutex<(usize, usize)>,
}

impl AdminService {
    pub fn new(ctx: Arc<ServerContext>, controller: Arc<RingController>) -> Self {
        AdminService {
            ctx,
            controller,
            compaction_threshold: Mutex::new((4, 32)),
        }
    }

    /// The ring as `token → endpoint`, in token order.
    pub fn ring(&self) -> Vec<(String, Endpoint)> {
        self.controller
            .ring_view()
            .into_iter()
            .map(|(token, endpoint)| (self.ctx.partitioner.token_to_string(&token), endpoint))
            .collect()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            token: self
                .controller
                .local_token()
                .map(|t| self.ctx.partitioner.token_to_string(&t)),
            operation_mode: self.controller.operation_mode().to_string(),
            generation: self.controller.generation(),
            live_members: self.ctx.gossiper.get_live_members().len(),
            dead_members: self.ctx.gossiper.get_dead_members().len(),
        }
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.controller.operation_mode()
    }

    /// Per-token ownership fractions, estimated from sampled splits.
    pub fn ownership(&self) -> HashMap<String, f64> {
        let ring = self.ctx.token_metadata.snapshot();
        let store = self.ctx.store.clone();
        self.ctx
            .partitioner
            .describe_ownership(ring.sorted_tokens(), &move |range| {
                store.sample_splits(range, 1).len()
            })
            .into_iter()
            .map(|(token, fraction)| (token.into_string(), fraction))
            .collect()
    }

    pub async fn drain(&self) -> Result<(), RingError> {
        self.controller.drain().await
    }

    pub async fn decommission(&self) -> Result<(), RingError> {
        self.controller.decommission().await
    }

    pub async fn move_token(&self, token: &str) -> Result<(), RingError> {
        let token = self.ctx.partitioner.token_from_string(token);
        self.ctx.partitioner.validate_token(&token)?;
        self.controller.move_token(Some(token)).await
    }

    pub async fn load_balance(&self) -> Result<(), RingError> {
        self.controller.load_balance().await
    }

    pub fn remove_token(&self, token: &str) -> Result<(), RingError> {
        let token: Token = self.ctx.partitioner.token_from_string(token);
        self.ctx.partitioner.validate_token(&token)?;
        self.controller.remove_token(&token)
    }

    pub fn resume_bootstrap(&self) {
        self.controller.resume_bootstrap();
    }

    pub async fn flush(&self, table: &str, column_families: &[String]) -> Result<(), StoreError> {
        self.ctx.store.flush(table, column_families).await
    }

    pub async fn compact(&self, table: &str, column_families: &[String]) -> Result<(), StoreError> {
        self.ctx.stats.compaction_started(table);
        let result = self.ctx.store.force_compaction(table, column_families).await;
        self.ctx.stats.compaction_finished(table);
        result
    }

    pub fn compaction_threshold(&self) -> (usize, usize) {
        *self
            .compaction_threshold
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_compaction_threshold(
        &self,
        min: usize,
        max: usize,
    ) -> Result<(), ConfigurationError> {
        if min > max || max == 0 {
            return Err(ConfigurationError::InvalidSetting(format!(
                "compaction thresholds {min}/{max}"
            )));
        }
        info!("compaction threshold set to {min}/{max}");
        *self
            .compaction_threshold
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (min, max);
        Ok(())
    }
}
