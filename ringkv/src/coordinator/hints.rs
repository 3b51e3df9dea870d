//! Hinted handoff: durable per-endpoint mutation queues replayed when the
//! target comes back.
//!
//! A hint is the serialized form of a mutation that could not be delivered
//! to a replica. Hints are appended in arrival order and replayed in that
//! order by a single delivery task per endpoint; a hint is deleted only
//! after the target acknowledged it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::net::{Message, Verb};
use crate::routing::Endpoint;
use crate::service::ServerContext;

/// One queued hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintRecord {
    /// Position in the endpoint's queue; strictly increasing.
    pub seq: u64,
    /// The serialized mutation, exactly as the write path produced it.
    pub mutation: Bytes,
}

/// Durable, append-only, per-endpoint ordered hint storage.
pub trait HintLog: Send + Sync {
    fn append(&self, target: Endpoint, mutation: &[u8]) -> Result<(), StoreError>;

    /// Undelivered hints for `target`, in append order.
    fn pending(&self, target: Endpoint) -> Result<Vec<HintRecord>, StoreError>;

    /// Marks one hint delivered. Delivery is in order, so everything up to
    /// and including `seq` is considered done.
    fn remove(&self, target: Endpoint, seq: u64) -> Result<(), StoreError>;

    /// Endpoints that still have undelivered hints.
    fn endpoints(&self) -> Vec<Endpoint>;
}

/// File-backed hint log: one record file and one delivered-marker file per
/// destination endpoint.
///
/// Record layout: `seq: u64 | len: u32 | mutation bytes`, big-endian. The
/// marker file holds the last delivered sequence number; both files are
/// removed once the queue fully drains.
pub struct FileHintLog {
    dir: PathBuf,
    next_seq: Mutex<HashMap<Endpoint, u64>>,
}

impl FileHintLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileHintLog {
            dir,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    fn data_path(&self, target: &Endpoint) -> PathBuf {
        self.dir.join(format!("{target}.hintlog"))
    }

    fn marker_path(&self, target: &Endpoint) -> PathBuf {
        self.dir.join(format!("{target}.delivered"))
    }

    fn read_marker(&self, target: &Endpoint) -> Result<Option<u64>, StoreError> {
        let path = self.marker_path(target);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = [0u8; 8];
        let mut file = fs::File::open(path)?;
        file.read_exact(&mut bytes)?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    fn read_records(path: &Path) -> Result<Vec<HintRecord>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read(path)?;
        let mut buf = &raw[..];
        let mut records = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 12 {
                return Err(StoreError::Corrupt(format!(
                    "truncated hint record in {}",
                    path.display()
                )));
            }
            let seq = buf.get_u64();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(StoreError::Corrupt(format!(
                    "truncated hint body in {}",
                    path.display()
                )));
            }
            records.push(HintRecord {
                seq,
                mutation: Bytes::copy_from_slice(&buf[..len]),
            });
            buf.advance(len);
        }
        Ok(records)
    }

    fn lock_seqs(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, u64>> {
        self.next_seq.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HintLog for FileHintLog {
    fn append(&self, target: Endpoint, mutation: &[u8]) -> Result<(), StoreError> {
        let mut seqs = self.lock_seqs();
        let next = match seqs.get(&target) {
            Some(next) => *next,
            None => Self::read_records(&self.data_path(&target))?
                .last()
                .map(|r| r.seq + 1)
                .unwrap_or(0),
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_path(&target))?;
        let mut frame = Vec::with_capacity(12 + mutation.len());
        frame.extend_from_slice(&next.to_be_bytes());
        frame.extend_from_slice(&(mutation.len() as u32).to_be_bytes());
        frame.extend_from_slice(mutation);
        file.write_all(&frame)?;
        file.sync_data()?;

        seqs.insert(target, next + 1);
        Ok(())
    }

    fn pending(&self, target: Endpoint) -> Result<Vec<HintRecord>, StoreError> {
        let records = Self::read_records(&self.data_path(&target))?;
        let delivered = self.read_marker(&target)?;
        Ok(match delivered {
            None => records,
            Some(marker) => records.into_iter().filter(|r| r.seq > marker).collect(),
        })
    }

    fn remove(&self, target: Endpoint, seq: u64) -> Result<(), StoreError> {
        let _guard = self.lock_seqs();
        let records = Self::read_records(&self.data_path(&target))?;
        if records.last().is_some_and(|last| last.seq <= seq) {
            // queue fully drained; drop the file family
            let _ = fs::remove_file(self.data_path(&target));
            let _ = fs::remove_file(self.marker_path(&target));
            return Ok(());
        }
        let mut file = fs::File::create(self.marker_path(&target))?;
        file.write_all(&seq.to_be_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let stem = name.strip_suffix(".hintlog")?;
                stem.parse().ok()
            })
            .collect()
    }
}

/// Replays stored hints when their targets come back to life.
pub struct HintedHandoffManager {
    ctx: Arc<ServerContext>,
    hint_log: Arc<dyn HintLog>,
    /// At most one delivery task per endpoint.
    queued_deliveries: Mutex<HashSet<Endpoint>>,
}

impl HintedHandoffManager {
    pub fn new(ctx: Arc<ServerContext>, hint_log: Arc<dyn HintLog>) -> Arc<Self> {
        Arc::new(HintedHandoffManager {
            ctx,
            hint_log,
            queued_deliveries: Mutex::new(HashSet::new()),
        })
    }

    pub fn hint_log(&self) -> &Arc<dyn HintLog> {
        &self.hint_log
    }

    /// Stores a hint for later delivery.
    pub fn store_hint(&self, target: Endpoint, serialized_mutation: &[u8]) {
        match self.hint_log.append(target, serialized_mutation) {
            Ok(()) => self.ctx.stats.hint_stored(&target),
            Err(e) => warn!("failed to store hint for {target}: {e}"),
        }
    }

    /// Called when gossip reports an endpoint alive again.
    pub fn on_endpoint_alive(self: &Arc<Self>, endpoint: Endpoint) {
        self.deliver_hints(endpoint);
    }

    /// Schedules a delivery task for the endpoint unless one is already
    /// queued or running.
    pub fn deliver_hints(self: &Arc<Self>, endpoint: Endpoint) {
        {
            let mut queued = self
                .queued_deliveries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !queued.insert(endpoint) {
                return;
            }
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.deliver_hints_to_endpoint(endpoint).await {
                warn!("hint delivery to {endpoint} failed: {e}");
            }
        });
    }

    pub(crate) async fn deliver_hints_to_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        self.queued_deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint);
        debug!("checking hint log for deliverables to {endpoint}");

        if !self.ctx.failure_detector.is_alive(&endpoint) {
            info!(
                "hint delivery to {endpoint} cancelled - endpoint is dead; \
                 will restart as soon as it is up again"
            );
            return Ok(());
        }

        let started = Instant::now();
        let hints = self.hint_log.pending(endpoint)?;
        if !hints.is_empty() {
            info!("started hinted handoff for {endpoint}");
        }

        let mut delivered = 0u64;
        'delivery: for hint in hints {
            while !self.deliver_hint(endpoint, &hint.mutation).await {
                // maybe a temporary problem; pause before retrying
                sleep(self.ctx.config.rpc_timeout).await;
                if !self.ctx.failure_detector.is_alive(&endpoint) {
                    info!(
                        "hint delivery to {endpoint} cancelled - endpoint is dead; \
                         will restart as soon as it is up again"
                    );
                    break 'delivery;
                }
            }
            self.hint_log.remove(endpoint, hint.seq)?;
            delivered += 1;

            if let Some(throttle) = self.ctx.config.hinted_handoff_throttle {
                sleep(throttle).await;
            }
        }

        if delivered > 0 {
            self.ctx.stats.hints_delivered(&endpoint, delivered);
            info!(
                "finished hinted handoff for {endpoint}: {delivered} mutations in {:?}",
                started.elapsed()
            );
        } else {
            debug!("finished hinted handoff check for {endpoint}");
        }
        Ok(())
    }

    /// One hint round trip expecting one acknowledgement.
    async fn deliver_hint(&self, endpoint: Endpoint, mutation: &Bytes) -> bool {
        let message = Message::new(
            Verb::Mutation,
            self.ctx.local_endpoint(),
            mutation.clone(),
        );
        matches!(
            timeout(
                self.ctx.config.rpc_timeout,
                self.ctx.transport.send_rr(message, endpoint),
            )
            .await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::ep;

    #[test]
    fn file_hint_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileHintLog::open(dir.path()).unwrap();

        log.append(ep(1), b"m1").unwrap();
        log.append(ep(1), b"m2").unwrap();
        log.append(ep(2), b"other").unwrap();

        let pending = log.pending(ep(1)).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].mutation, &b"m1"[..]);
        assert_eq!(pending[1].mutation, &b"m2"[..]);
        assert!(pending[0].seq < pending[1].seq);

        let mut endpoints = log.endpoints();
        endpoints.sort();
        assert_eq!(endpoints, vec![ep(1), ep(2)]);
    }

    #[test]
    fn removal_is_durable_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileHintLog::open(dir.path()).unwrap();

        log.append(ep(1), b"m1").unwrap();
        log.append(ep(1), b"m2").unwrap();
        log.append(ep(1), b"m3").unwrap();

        let pending = log.pending(ep(1)).unwrap();
        log.remove(ep(1), pending[0].seq).unwrap();

        // a fresh instance over the same directory sees the same state
        let reopened = FileHintLog::open(dir.path()).unwrap();
        let pending = reopened.pending(ep(1)).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].mutation, &b"m2"[..]);
    }

    #[test]
    fn drained_queue_drops_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileHintLog::open(dir.path()).unwrap();

        log.append(ep(1), b"m1").unwrap();
        let pending = log.pending(ep(1)).unwrap();
        log.remove(ep(1), pending[0].seq).unwrap();

        assert!(log.pending(ep(1)).unwrap().is_empty());
        assert!(log.endpoints().is_empty());

        // sequence numbers keep increasing after a drain
        log.append(ep(1), b"m2").unwrap();
        assert_eq!(log.pending(ep(1)).unwrap().len(), 1);
    }
}
