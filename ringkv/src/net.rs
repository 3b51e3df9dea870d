//! Message surface of the coordination core.
//!
//! The wire protocol itself is owned by the transport collaborator; this
//! module fixes what the core depends on: the verb enumeration (new verbs
//! are appended, wire ordinals never change), the message envelope, the
//! bodies the coordinators exchange, and the gossip `MOVE` application-state
//! codec.

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec;
use crate::db::Row;
use crate::errors::{CodecError, TransportError};
use crate::routing::{Endpoint, Range, Token};

/// Message verbs in wire-ordinal order. Append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Mutation = 0,
    Binary,
    ReadRepair,
    Read,
    ReadResponse,
    StreamInitiate,
    StreamInitiateDone,
    StreamFinished,
    StreamRequest,
    RangeSlice,
    BootstrapToken,
    TreeRequest,
    TreeResponse,
    Join,
    GossipDigestSyn,
    GossipDigestAck,
    GossipDigestAck2,
}

impl TryFrom<u8> for Verb {
    type Error = CodecError;

    fn try_from(ordinal: u8) -> Result<Self, CodecError> {
        use Verb::*;
        Ok(match ordinal {
            0 => Mutation,
            1 => Binary,
            2 => ReadRepair,
            3 => Read,
            4 => ReadResponse,
            5 => StreamInitiate,
            6 => StreamInitiateDone,
            7 => StreamFinished,
            8 => StreamRequest,
            9 => RangeSlice,
            10 => BootstrapToken,
            11 => TreeRequest,
            12 => TreeResponse,
            13 => Join,
            14 => GossipDigestSyn,
            15 => GossipDigestAck,
            16 => GossipDigestAck2,
            other => return Err(CodecError::UnknownVerb(other)),
        })
    }
}

/// The envelope every coordinated request and reply travels in.
#[derive(Debug, Clone)]
pub struct Message {
    pub verb: Verb,
    pub from: Endpoint,
    pub body: Bytes,
}

impl Message {
    pub fn new(verb: Verb, from: Endpoint, body: impl Into<Bytes>) -> Self {
        Message {
            verb,
            from,
            body: body.into(),
        }
    }
}

/// Point-to-point messaging. Delivery to any single endpoint is FIFO, which
/// the write path relies on for per-replica program order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget send; failures are invisible to the caller.
    fn send_one_way(&self, message: Message, to: Endpoint);

    /// Request/response round trip. The future resolves when the peer
    /// replies or the transport gives up on the send.
    async fn send_rr(&self, message: Message, to: Endpoint) -> Result<Message, TransportError>;
}

/// Body of a [`Verb::Read`] request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCommand {
    pub table: String,
    pub key: String,
    /// Digest-only reads return a hash of the row instead of its columns.
    pub digest: bool,
}

impl ReadCommand {
    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::new();
        codec::write_string(&mut buf, &self.table);
        codec::write_string(&mut buf, &self.key);
        codec::write_bool(&mut buf, self.digest);
        Bytes::from(buf)
    }

    pub fn deserialize(mut buf: &[u8]) -> Result<Self, CodecError> {
        let buf = &mut buf;
        Ok(ReadCommand {
            table: codec::read_string(buf)?,
            key: codec::read_string(buf)?,
            digest: codec::read_bool(buf)?,
        })
    }
}

/// Body of a [`Verb::ReadResponse`]: either the full row or its digest,
/// depending on what was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    Data(Row),
    Digest(Bytes),
}

impl ReadResponse {
    pub fn is_digest(&self) -> bool {
        matches!(self, ReadResponse::Digest(_))
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::new();
        match self {
            ReadResponse::Data(row) => {
                codec::write_bool(&mut buf, false);
                row.serialize(&mut buf);
            }
            ReadResponse::Digest(digest) => {
                codec::write_bool(&mut buf, true);
                codec::write_blob(&mut buf, digest);
            }
        }
        Bytes::from(buf)
    }

    pub fn deserialize(mut buf: &[u8]) -> Result<Self, CodecError> {
        let buf = &mut buf;
        if codec::read_bool(buf)? {
            Ok(ReadResponse::Digest(Bytes::from(codec::read_blob(buf)?)))
        } else {
            Ok(ReadResponse::Data(Row::deserialize(buf)?))
        }
    }
}

/// Body of the stream verbs: which table and ring arc is being moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub table: String,
    pub range: Range,
}

impl StreamRequest {
    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::new();
        codec::write_string(&mut buf, &self.table);
        codec::write_string(&mut buf, self.range.left.as_str());
        codec::write_string(&mut buf, self.range.right.as_str());
        Bytes::from(buf)
    }

    pub fn deserialize(mut buf: &[u8]) -> Result<Self, CodecError> {
        let buf = &mut buf;
        Ok(StreamRequest {
            table: codec::read_string(buf)?,
            range: Range::new(
                Token::new(codec::read_string(buf)?),
                Token::new(codec::read_string(buf)?),
            ),
        })
    }
}

/// The gossip `MOVE` application state: `state,token[,extra,token]`.
///
/// The delimiter must never occur inside a token; the partitioners only emit
/// delimiter-free tokens.
pub mod move_state {
    use super::CodecError;

    pub const MOVE_STATE: &str = "MOVE";
    pub const DELIMITER: char = ',';

    pub const STATE_BOOTSTRAPPING: &str = "BOOT";
    pub const STATE_NORMAL: &str = "NORMAL";
    pub const STATE_LEAVING: &str = "LEAVING";
    pub const STATE_LEFT: &str = "LEFT";
    pub const STATE_HIBERNATE: &str = "hibernate";
    pub const REMOVE_TOKEN: &str = "remove";

    /// A parsed `MOVE` value. Tokens stay in their string form; the active
    /// partitioner's factory interprets them.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MoveValue {
        Bootstrapping {
            token: String,
        },
        Normal {
            token: String,
            /// Set when this node is proxying a dead node's token removal.
            removed_token: Option<String>,
        },
        Leaving {
            token: String,
        },
        Left {
            token: String,
        },
        /// Node is held down while a replacement boots with the same token.
        Hibernate,
    }

    pub fn format(value: &MoveValue) -> String {
        match value {
            MoveValue::Bootstrapping { token } => {
                format!("{STATE_BOOTSTRAPPING}{DELIMITER}{token}")
            }
            MoveValue::Normal {
                token,
                removed_token: None,
            } => format!("{STATE_NORMAL}{DELIMITER}{token}"),
            MoveValue::Normal {
                token,
                removed_token: Some(removed),
            } => format!("{STATE_NORMAL}{DELIMITER}{token}{DELIMITER}{REMOVE_TOKEN}{DELIMITER}{removed}"),
            MoveValue::Leaving { token } => format!("{STATE_LEAVING}{DELIMITER}{token}"),
            MoveValue::Left { token } => format!("{STATE_LEFT}{DELIMITER}{token}"),
            MoveValue::Hibernate => format!("{STATE_HIBERNATE}{DELIMITER}true"),
        }
    }

    pub fn parse(value: &str) -> Result<MoveValue, CodecError> {
        let pieces: Vec<&str> = value.split(DELIMITER).collect();
        let bad = || CodecError::BadValue(format!("malformed MOVE value: {value}"));

        match pieces.as_slice() {
            [STATE_BOOTSTRAPPING, token] => Ok(MoveValue::Bootstrapping {
                token: (*token).to_owned(),
            }),
            [STATE_NORMAL, token] => Ok(MoveValue::Normal {
                token: (*token).to_owned(),
                removed_token: None,
            }),
            [STATE_NORMAL, token, REMOVE_TOKEN, removed] => Ok(MoveValue::Normal {
                token: (*token).to_owned(),
                removed_token: Some((*removed).to_owned()),
            }),
            [STATE_LEAVING, token] => Ok(MoveValue::Leaving {
                token: (*token).to_owned(),
            }),
            [STATE_LEFT, token] => Ok(MoveValue::Left {
                token: (*token).to_owned(),
            }),
            [STATE_HIBERNATE, ..] => Ok(MoveValue::Hibernate),
            _ => Err(bad()),
        }
    }

    /// True when the state value reports a node that no longer serves:
    /// absent state, left, or hibernating.
    pub fn is_dead_state(value: Option<&str>) -> bool {
        match value.map(parse) {
            None => true,
            Some(Ok(MoveValue::Left { .. })) | Some(Ok(MoveValue::Hibernate)) => true,
            Some(_) => false,
        }
    }
}
