//! The node's persisted `system` metadata record.
//!
//! One small local file holding what a node must remember across restarts:
//! which cluster it belongs to, the token it owns (or was bootstrapping
//! to), whether bootstrap ever completed, and the startup generation used
//! to win token-collision disputes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::errors::{CodecError, FatalError};
use crate::routing::Token;

const SYSTEM_FILE: &str = "system.record";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    pub cluster_name: String,
    pub token: Option<Token>,
    pub bootstrapped: bool,
    /// Incremented on every process start.
    pub generation: i64,
}

impl SystemRecord {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_string(&mut buf, &self.cluster_name);
        match &self.token {
            Some(token) => {
                codec::write_bool(&mut buf, true);
                codec::write_string(&mut buf, token.as_str());
            }
            None => codec::write_bool(&mut buf, false),
        }
        codec::write_bool(&mut buf, self.bootstrapped);
        buf.extend_from_slice(&self.generation.to_be_bytes());
        buf
    }

    fn deserialize(mut buf: &[u8]) -> Result<Self, CodecError> {
        let buf = &mut buf;
        let cluster_name = codec::read_string(buf)?;
        let token = if codec::read_bool(buf)? {
            Some(Token::new(codec::read_string(buf)?))
        } else {
            None
        };
        let bootstrapped = codec::read_bool(buf)?;
        let generation = codec::read_i64(buf)?;
        Ok(SystemRecord {
            cluster_name,
            token,
            bootstrapped,
            generation,
        })
    }
}

/// Loads, verifies and rewrites the system record.
#[derive(Debug)]
pub struct SystemStore {
    path: PathBuf,
}

impl SystemStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, FatalError> {
        fs::create_dir_all(data_dir.as_ref())?;
        Ok(SystemStore {
            path: data_dir.as_ref().join(SYSTEM_FILE),
        })
    }

    /// Loads the record, creating a fresh one on first start. The startup
    /// generation is bumped and persisted before returning. A cluster-name
    /// mismatch with an existing record is fatal.
    pub fn initialize(&self, cluster_name: &str) -> Result<SystemRecord, FatalError> {
        let mut record = match self.load()? {
            Some(record) => {
                if record.cluster_name != cluster_name {
                    return Err(FatalError::ClusterNameMismatch {
                        saved: record.cluster_name,
                        configured: cluster_name.to_owned(),
                    });
                }
                record
            }
            None => SystemRecord {
                cluster_name: cluster_name.to_owned(),
                token: None,
                bootstrapped: false,
                generation: 0,
            },
        };
        record.generation += 1;
        self.save(&record)?;
        Ok(record)
    }

    pub fn load(&self) -> Result<Option<SystemRecord>, FatalError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.path)?;
        let record = SystemRecord::deserialize(&raw)
            .map_err(|e| FatalError::InvalidBootState(format!("corrupt system record: {e}")))?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &SystemRecord) -> Result<(), FatalError> {
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&record.serialize())?;
        file.sync_data()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Updates the saved token without touching the rest of the record.
    pub fn update_token(&self, record: &mut SystemRecord, token: Token) -> Result<(), FatalError> {
        record.token = Some(token);
        self.save(record)
    }

    pub fn set_bootstrapped(
        &self,
        record: &mut SystemRecord,
        bootstrapped: bool,
    ) -> Result<(), FatalError> {
        record.bootstrapped = bootstrapped;
        self.save(record)
    }
}
