//! Error taxonomy of the coordination core.
//!
//! The coordinators convert every internal failure into one of these types
//! at their public boundary. Background tasks (hint replay, read repair,
//! consistency checks) never surface errors to clients; they log and retry
//! on the next trigger.

use std::sync::Arc;

use thiserror::Error;

use crate::routing::Endpoint;

/// Raised before any dispatch when too few live replicas remain for the
/// requested consistency level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot achieve consistency: {alive} live replicas, {required} required")]
pub struct UnavailableError {
    pub required: usize,
    pub alive: usize,
}

/// Data and digest responses disagreed on a read. Recovered internally by a
/// second full-data pass; surfaced only if the retry still disagrees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("digest mismatch for key {key}: {digest1:02x?} vs {digest2:02x?}")]
pub struct DigestMismatchError {
    pub key: String,
    pub digest1: Vec<u8>,
    pub digest2: Vec<u8>,
}

/// Detected at strategy construction or token validation; fatal to the
/// affected table's participation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error(
        "number of unique racks ({racks}) must match replication factor \
         ({replication_factor}) of table {table}"
    )]
    RacksDontMatchReplicationFactor {
        table: String,
        racks: usize,
        replication_factor: usize,
    },

    #[error("rack {0} has no ring members")]
    EmptyRack(String),

    #[error("invalid bloom filter specification: {0}")]
    InvalidBloomSpec(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Failure decoding a message body or an on-disk record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    UnexpectedEndOfBuffer,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown verb ordinal {0}")]
    UnknownVerb(u8),

    #[error("malformed value: {0}")]
    BadValue(String),
}

/// Inbound parse or outbound send failure; the caller moves on to the next
/// replica.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    #[error("failed to send to {to}: {reason}")]
    SendFailed { to: Endpoint, reason: String },

    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
}

/// Failure inside the local storage collaborator.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

/// Error surfaced by the read coordinator.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ReadError {
    #[error(transparent)]
    Unavailable(#[from] UnavailableError),

    #[error("read timed out: {received} of {required} responses")]
    Timeout { received: usize, required: usize },

    #[error(transparent)]
    DigestMismatch(#[from] DigestMismatchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigurationError),
}

/// Error surfaced by the write coordinator. A timed-out write is not rolled
/// back; hinted handoff and read repair converge it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum WriteError {
    #[error(transparent)]
    Unavailable(#[from] UnavailableError),

    #[error("write timed out: {acks} of {required} acknowledgements")]
    Timeout { acks: usize, required: usize },

    #[error("node is draining; mutations are rejected")]
    Draining,

    #[error(transparent)]
    Config(#[from] ConfigurationError),
}

/// Unrecoverable startup failure; the process exits deterministically.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FatalError {
    #[error("saved cluster name {saved} != configured name {configured}")]
    ClusterNameMismatch { saved: String, configured: String },

    #[error("invalid boot state: {0}")]
    InvalidBootState(String),

    #[error("storage io error on init: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FatalError {
    fn from(e: std::io::Error) -> Self {
        FatalError::Io(Arc::new(e))
    }
}

/// Error from a ring lifecycle operation (bootstrap, move, decommission,
/// token removal, drain).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RingError {
    #[error("local node is not a member of the token ring yet")]
    NotAMember,

    #[error("no other normal nodes in the ring; operation would be pointless")]
    NoOtherMembers,

    #[error("data is currently moving to this node; unable to leave the ring")]
    PendingMovement,

    #[error("target token {0} is already owned by another node")]
    TokenAlreadyOwned(String),

    #[error("token {0} is not owned by any node")]
    UnknownToken(String),

    #[error("cannot remove the local node's own token")]
    RemovingSelf,

    #[error("operation not valid in mode {0}")]
    InvalidState(String),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigurationError),
}
