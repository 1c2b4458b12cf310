//! Ordered key-value primitive underneath the telemetry store.
//!
//! The store only needs three things from its engine: single-key `put`,
//! point `get`, and iteration in key order starting from an arbitrary key in
//! either direction. [`OrderedKv`] captures exactly that so the store can run
//! on [`SledKv`] in production and [`MemoryKv`] in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::KvError;

/// A key/value pair yielded by iteration.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy iterator over pairs in key order.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair, KvError>> + 'a>;

/// A sorted byte-string map with single-key atomic writes.
pub trait OrderedKv: Send + Sync + fmt::Debug {
    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the engine fails to commit the write.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the engine fails to read.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Iterates from `from` (inclusive).
    ///
    /// Forward iteration yields keys `>= from` ascending; reverse iteration
    /// yields keys `<= from` descending.
    fn iterate(&self, from: &[u8], reverse: bool) -> KvIter<'_>;

    /// Makes every completed write durable.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the engine fails to flush.
    fn flush(&self) -> Result<(), KvError>;
}

/// [`OrderedKv`] over one `sled` tree.
#[derive(Debug, Clone)]
pub struct SledKv {
    tree: sled::Tree,
    sync_writes: bool,
}

impl SledKv {
    /// Wraps a tree. With `sync_writes`, every `put` is flushed before it
    /// returns.
    pub fn new(tree: sled::Tree, sync_writes: bool) -> Self {
        Self { tree, sync_writes }
    }
}

impl OrderedKv for SledKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.tree.insert(key, value)?;
        if self.sync_writes {
            self.tree.flush()?;
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn iterate(&self, from: &[u8], reverse: bool) -> KvIter<'_> {
        let from = from.to_vec();
        let to_pair = |item: sled::Result<(sled::IVec, sled::IVec)>| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(KvError::from)
        };
        if reverse {
            Box::new(self.tree.range(..=from).rev().map(to_pair))
        } else {
            Box::new(self.tree.range(from..).map(to_pair))
        }
    }

    fn flush(&self) -> Result<(), KvError> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Pairs copied out of a [`MemoryKv`] per read lock.
const SCAN_CHUNK: usize = 64;

/// In-memory [`OrderedKv`]; clones share the same map.
///
/// Iteration copies at most [`SCAN_CHUNK`] pairs at a time under a short
/// read lock and resumes after the last key it yielded. A scan that stops
/// early never touches the rest of the map, and writes made during a scan
/// may be observed from the next chunk on.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl OrderedKv for MemoryKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn iterate(&self, from: &[u8], reverse: bool) -> KvIter<'_> {
        Box::new(MemoryScan {
            map: &self.map,
            cursor: Some(Bound::Included(from.to_vec())),
            reverse,
            buffered: Vec::new().into_iter(),
        })
    }

    fn flush(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Chunked walk over a [`MemoryKv`] map.
struct MemoryScan<'a> {
    map: &'a RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Where the next chunk starts; `None` once the map is exhausted.
    cursor: Option<Bound<Vec<u8>>>,
    reverse: bool,
    buffered: std::vec::IntoIter<KvPair>,
}

impl MemoryScan<'_> {
    fn fill(&self, cursor: &Bound<Vec<u8>>) -> Vec<KvPair> {
        let bound = cursor.as_ref().map(Vec::as_slice);
        let map = self.map.read();
        let copy = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        if self.reverse {
            map.range::<[u8], _>((Bound::Unbounded, bound))
                .rev()
                .take(SCAN_CHUNK)
                .map(copy)
                .collect()
        } else {
            map.range::<[u8], _>((bound, Bound::Unbounded))
                .take(SCAN_CHUNK)
                .map(copy)
                .collect()
        }
    }
}

impl Iterator for MemoryScan<'_> {
    type Item = Result<KvPair, KvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pair) = self.buffered.next() {
            return Some(Ok(pair));
        }
        let cursor = self.cursor.take()?;
        let chunk = self.fill(&cursor);
        if chunk.len() == SCAN_CHUNK {
            self.cursor = chunk.last().map(|(k, _)| Bound::Excluded(k.clone()));
        }
        self.buffered = chunk.into_iter();
        self.buffered.next().map(Ok)
    }
}
