//! Cluster coordination core of an eventually-consistent, ring-partitioned
//! key/column store.
//!
//! The crate owns the consistent-hash token ring and everything that routes
//! requests over it:
//! - the ring data model and partitioners ([`routing`]),
//! - the authoritative in-memory ring state ([`cluster::TokenMetadata`]),
//! - replica placement, including the rack-aware per-rack sub-ring variant
//!   ([`routing::locator`]),
//! - the per-key quorum read and write coordinators with digest verification,
//!   read repair and hinted handoff ([`coordinator`]),
//! - the ring membership state machine driven by gossip
//!   ([`cluster::RingController`]).
//!
//! Storage engines, the gossip transport, the failure detector and the snitch
//! are external collaborators reached through the traits in [`service`] and
//! [`net`]; they are bundled into a [`service::ServerContext`] at startup and
//! passed explicitly (there are no global singletons).

pub mod client;
pub mod cluster;
pub(crate) mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod net;
pub mod routing;
pub mod service;
pub mod utils;

pub use cluster::{RingController, TokenMetadata};
pub use config::Config;
pub use coordinator::{ConsistencyLevel, ReadCoordinator, WriteCoordinator};
pub use routing::{DecoratedKey, Endpoint, Range, Token};
pub use service::ServerContext;
