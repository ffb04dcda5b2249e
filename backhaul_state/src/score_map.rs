//! The score map: a stat cache keyed by file identity.

use std::path::Path;

use dashmap::DashMap;
use minicbor::{Decode, Encode};

use backhaul_core::Score;
use backhaul_core::listing::Timespec;

/// Identity of one file as observed by stat.
///
/// Equality is structural across every field: any change to the path,
/// permission bits, ownership, mtime, inode, or size makes a different
/// key, and the cache misses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
#[cbor(map)]
pub struct ScoreMapKey {
    #[n(0)]
    pub path: String,
    #[n(1)]
    pub permissions: u32,
    #[n(2)]
    pub uid: u32,
    #[n(3)]
    pub gid: u32,
    #[n(4)]
    pub mtime: Timespec,
    #[n(5)]
    pub inode: u64,
    #[n(6)]
    pub size: u64,
}

impl ScoreMapKey {
    /// Build a key for the file at `path` from its stat fields.
    pub fn new(
        path: &Path,
        permissions: u32,
        uid: u32,
        gid: u32,
        mtime: Timespec,
        inode: u64,
        size: u64,
    ) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            permissions,
            uid,
            gid,
            mtime,
            inode,
            size,
        }
    }
}

/// Concurrent map from file identity to the file's chunk scores.
///
/// Safe for parallel `get`/`set`; the last writer for a key wins. Two
/// instances are used per run: a read-only map loaded from the previous
/// run and a sink map that collects this run's entries, so stale entries
/// never propagate forward.
#[derive(Debug, Default)]
pub struct ScoreMap {
    entries: DashMap<ScoreMapKey, Vec<Score>>,
}

impl ScoreMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ScoreMapKey) -> Option<Vec<Score>> {
        self.entries.get(key).map(|scores| scores.clone())
    }

    pub fn set(&self, key: ScoreMapKey, scores: Vec<Score>) {
        self.entries.insert(key, scores);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the contents, sorted by key for deterministic encoding.
    pub(crate) fn to_records(&self) -> Vec<(ScoreMapKey, Vec<Score>)> {
        let mut records: Vec<(ScoreMapKey, Vec<Score>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records.sort_by(|(a, _), (b, _)| a.cmp(b));
        records
    }

    pub(crate) fn from_records(records: Vec<(ScoreMapKey, Vec<Score>)>) -> Self {
        let entries = DashMap::new();
        for (key, scores) in records {
            entries.insert(key, scores);
        }
        Self { entries }
    }
}
