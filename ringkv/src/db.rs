//! The column model the coordinators operate on.
//!
//! Only as much of the storage data model as the read and write paths need:
//! named columns with write timestamps and tombstones, grouped into a column
//! family per row. Reconciliation is per-column last-write-wins with
//! tombstones taking precedence on timestamp ties.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::codec;
use crate::errors::CodecError;
use crate::utils::murmur;

/// A single named cell: value, write timestamp, tombstone marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub value: Bytes,
    pub timestamp: i64,
    pub tombstone: bool,
}

impl Column {
    pub fn live(value: impl Into<Bytes>, timestamp: i64) -> Self {
        Column {
            value: value.into(),
            timestamp,
            tombstone: false,
        }
    }

    pub fn deleted(timestamp: i64) -> Self {
        Column {
            value: Bytes::new(),
            timestamp,
            tombstone: true,
        }
    }

    /// True when this column supersedes `other` under reconciliation:
    /// later timestamp wins; on a tie the tombstone wins; on a full tie the
    /// larger value wins so reconciliation stays commutative.
    fn supersedes(&self, other: &Column) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (self.tombstone, other.tombstone) {
                (true, false) => true,
                (false, true) => false,
                _ => self.value > other.value,
            },
        }
    }
}

/// An ordered set of columns belonging to one row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnFamily {
    columns: BTreeMap<String, Column>,
}

impl ColumnFamily {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, column: Column) {
        let name = name.into();
        match self.columns.get(&name) {
            Some(existing) if !column.supersedes(existing) => {}
            _ => {
                self.columns.insert(name, column);
            }
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Column)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Merges `other` into `self`, column by column.
    pub fn resolve(&mut self, other: &ColumnFamily) {
        for (name, column) in &other.columns {
            self.insert(name.clone(), column.clone());
        }
    }

    /// The superset of all versions, or `None` when every version is absent.
    pub fn resolve_superset<'a>(
        versions: impl IntoIterator<Item = Option<&'a ColumnFamily>>,
    ) -> Option<ColumnFamily> {
        let mut resolved: Option<ColumnFamily> = None;
        for version in versions.into_iter().flatten() {
            match &mut resolved {
                None => resolved = Some(version.clone()),
                Some(acc) => acc.resolve(version),
            }
        }
        resolved
    }

    /// What `superset` has that this version is missing or holds an older
    /// copy of; `None` when this version is already complete.
    pub fn diff(&self, superset: &ColumnFamily) -> Option<ColumnFamily> {
        let mut missing = ColumnFamily::new();
        for (name, column) in &superset.columns {
            match self.columns.get(name) {
                Some(mine) if !column.supersedes(mine) => {}
                _ => missing.insert(name.clone(), column.clone()),
            }
        }
        if missing.is_empty() {
            None
        } else {
            Some(missing)
        }
    }

    /// An opaque 16-byte digest of the serialized family, compared
    /// byte-for-byte on the read path.
    pub fn digest(&self) -> [u8; 16] {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        let h1 = murmur::hash64(&buf, 0);
        let h2 = murmur::hash64(&buf, h1);
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&h1.to_be_bytes());
        out[8..].copy_from_slice(&h2.to_be_bytes());
        out
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        use bytes::BufMut;
        buf.put_u32(self.columns.len() as u32);
        for (name, column) in &self.columns {
            codec::write_string(buf, name);
            codec::write_blob(buf, &column.value);
            buf.put_i64(column.timestamp);
            codec::write_bool(buf, column.tombstone);
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let count = codec::read_u32(buf)?;
        let mut cf = ColumnFamily::new();
        for _ in 0..count {
            let name = codec::read_string(buf)?;
            let value = Bytes::from(codec::read_blob(buf)?);
            let timestamp = codec::read_i64(buf)?;
            let tombstone = codec::read_bool(buf)?;
            cf.columns.insert(
                name,
                Column {
                    value,
                    timestamp,
                    tombstone,
                },
            );
        }
        Ok(cf)
    }
}

/// Digest of a possibly-absent row. A missing row digests as an empty
/// column family, so data and digest replicas agree on absence.
pub fn row_digest(cf: Option<&ColumnFamily>) -> [u8; 16] {
    match cf {
        Some(cf) => cf.digest(),
        None => ColumnFamily::new().digest(),
    }
}

/// A resolved row handed back to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub cf: Option<ColumnFamily>,
}

impl Row {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        codec::write_string(buf, &self.key);
        match &self.cf {
            Some(cf) => {
                codec::write_bool(buf, true);
                cf.serialize(buf);
            }
            None => codec::write_bool(buf, false),
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let key = codec::read_string(buf)?;
        let cf = if codec::read_bool(buf)? {
            Some(ColumnFamily::deserialize(buf)?)
        } else {
            None
        };
        Ok(Row { key, cf })
    }
}

/// A keyed set of column modifications applied as one unit.
///
/// Serialized exactly once per write; the same bytes feed the replica
/// dispatch, the hint log and read-repair messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutation {
    pub table: String,
    pub key: String,
    pub columns: ColumnFamily,
}

impl RowMutation {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        RowMutation {
            table: table.into(),
            key: key.into(),
            columns: ColumnFamily::new(),
        }
    }

    pub fn with_columns(
        table: impl Into<String>,
        key: impl Into<String>,
        columns: ColumnFamily,
    ) -> Self {
        RowMutation {
            table: table.into(),
            key: key.into(),
            columns,
        }
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Bytes>, timestamp: i64) {
        self.columns.insert(name, Column::live(value, timestamp));
    }

    pub fn delete(&mut self, name: impl Into<String>, timestamp: i64) {
        self.columns.insert(name, Column::deleted(timestamp));
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = Vec::new();
        codec::write_string(&mut buf, &self.table);
        codec::write_string(&mut buf, &self.key);
        self.columns.serialize(&mut buf);
        Bytes::from(buf)
    }

    pub fn deserialize(mut buf: &[u8]) -> Result<Self, CodecError> {
        let buf = &mut buf;
        let table = codec::read_string(buf)?;
        let key = codec::read_string(buf)?;
        let columns = ColumnFamily::deserialize(buf)?;
        Ok(RowMutation {
            table,
            key,
            columns,
        })
    }
}
