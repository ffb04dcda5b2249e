//! Durable run state: everything Backhaul remembers between runs.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashSet;
use minicbor::{Decode, Encode};

use backhaul_core::{Result, Score};

use crate::score_map::{ScoreMap, ScoreMapKey};

/// State carried between runs: the set of scores known durable in the
/// object store, the score-set version those scores were read under, and
/// the score map.
#[derive(Debug)]
pub struct PersistentState {
    pub existing_scores: Arc<DashSet<Score>>,
    pub score_set_version: u64,
    pub score_map: Arc<ScoreMap>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Encode, Decode)]
#[cbor(map)]
struct Snapshot {
    #[n(0)]
    scores: Vec<String>,
    #[n(1)]
    version: u64,
    #[n(2)]
    score_map: Vec<MapRecord>,
}

#[derive(Encode, Decode)]
#[cbor(map)]
struct MapRecord {
    #[n(0)]
    key: ScoreMapKey,
    #[n(1)]
    scores: Vec<Score>,
}

impl PersistentState {
    /// Empty state for a first run.
    pub fn new() -> Self {
        Self {
            existing_scores: Arc::new(DashSet::new()),
            score_set_version: 0,
            score_map: Arc::new(ScoreMap::new()),
        }
    }

    /// Encode the full state onto a byte stream.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let mut scores: Vec<String> = self
            .existing_scores
            .iter()
            .map(|score| score.to_hex())
            .collect();
        scores.sort();

        let snapshot = Snapshot {
            scores,
            version: self.score_set_version,
            score_map: self
                .score_map
                .to_records()
                .into_iter()
                .map(|(key, scores)| MapRecord { key, scores })
                .collect(),
        };

        let encoded =
            minicbor::to_vec(&snapshot).map_err(|e| anyhow::anyhow!("encoding state: {e}"))?;
        writer.write_all(&encoded).context("writing state")?;
        Ok(())
    }

    /// Decode a full state from a byte stream, replacing every field.
    pub fn load(reader: &mut dyn Read) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).context("reading state")?;
        let snapshot: Snapshot =
            minicbor::decode(&buf).map_err(|e| anyhow::anyhow!("decoding state: {e}"))?;

        let existing_scores = DashSet::new();
        for hex in snapshot.scores {
            let score: Score = hex
                .parse()
                .map_err(|e| anyhow::anyhow!("state holds a bad score {hex:?}: {e}"))?;
            existing_scores.insert(score);
        }

        Ok(Self {
            existing_scores: Arc::new(existing_scores),
            score_set_version: snapshot.version,
            score_map: Arc::new(ScoreMap::from_records(
                snapshot
                    .score_map
                    .into_iter()
                    .map(|record| (record.key, record.scores))
                    .collect(),
            )),
        })
    }

    /// Save to a file, atomically: write a temp file next to the target,
    /// sync it, and rename into place.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("state path {path:?} has no parent directory"))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).context("creating temp file")?;
        self.save(&mut temp)?;
        temp.as_file().sync_all().context("syncing state file")?;
        temp.persist(path)
            .with_context(|| format!("persisting state to {path:?}"))?;
        tracing::debug!(?path, "saved persistent state");
        Ok(())
    }

    /// Load from a file; a missing file yields fresh empty state.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(?path, "no saved state; starting fresh");
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("opening state {path:?}")));
            }
        };
        Self::load(&mut file).with_context(|| format!("loading state from {path:?}"))
    }
}
