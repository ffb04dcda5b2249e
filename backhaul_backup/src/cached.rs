//! The score-map gate in front of the file saver.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use backhaul_core::{Result, Score};
use backhaul_fs::FileSystem;
use backhaul_state::{ScoreMap, ScoreMapKey};

use crate::chunker::PathSaver;

/// Skip the cache for files modified within this long of now: a file can
/// change again inside the same stat granule, and the key would not see
/// it.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Consults the previous run's score map before chunking a file.
///
/// The key is the file's full stat identity, so any change to contents
/// (size or mtime), ownership, permissions, or inode misses. Hits return
/// the cached chunk scores without reading the file at all; misses run
/// the underlying saver and record its result into the sink map. Source
/// and sink are distinct maps so entries for files that vanished this run
/// do not survive into the next.
pub struct CachingSaver {
    inner: Arc<dyn PathSaver>,
    fs: Arc<dyn FileSystem>,
    source: Arc<ScoreMap>,
    sink: Arc<ScoreMap>,
}

impl Debug for CachingSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingSaver")
            .field("source_entries", &self.source.len())
            .field("sink_entries", &self.sink.len())
            .finish_non_exhaustive()
    }
}

impl CachingSaver {
    pub fn new(
        inner: Arc<dyn PathSaver>,
        fs: Arc<dyn FileSystem>,
        source: Arc<ScoreMap>,
        sink: Arc<ScoreMap>,
    ) -> Self {
        Self {
            inner,
            fs,
            source,
            sink,
        }
    }

    fn is_fresh(mtime_sec: i64) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (now - mtime_sec).abs() < FRESHNESS_WINDOW.as_secs() as i64
    }
}

#[async_trait]
impl PathSaver for CachingSaver {
    async fn save_path(&self, path: &Path) -> Result<Vec<Score>> {
        let info = self.fs.stat(path).await?;
        let key = ScoreMapKey::new(
            path,
            info.permissions,
            info.uid,
            info.gid,
            info.mtime,
            info.inode,
            info.size,
        );

        // Files modified a moment ago can mutate again without changing
        // their stat identity; never trust the cache for those.
        if Self::is_fresh(info.mtime.sec) {
            tracing::debug!(?path, "mtime too recent; bypassing score map");
            return self.inner.save_path(path).await;
        }

        if let Some(scores) = self.source.get(&key) {
            tracing::debug!(?path, "score map hit");
            self.sink.set(key, scores.clone());
            return Ok(scores);
        }

        let scores = self.inner.save_path(path).await?;
        self.sink.set(key, scores.clone());
        Ok(scores)
    }
}
