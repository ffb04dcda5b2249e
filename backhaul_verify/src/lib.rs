//! Verification of the stored score graph.
//!
//! Starting from the root scores of recorded backups, [`Verifier`] walks
//! the listing DAG breadth-first with bounded concurrency. Every score
//! reached must be in the caller's known-score set; directory listings are
//! loaded and parsed to find their children; file blobs are only loaded
//! when `read_files` is set (the checking layer then re-validates their
//! hashes). Per-node failures are collected, not fatal, so one corrupt
//! listing still yields a complete report.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use minicbor::{Decode, Encode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use backhaul_core::error::{Cancelled, is_kind};
use backhaul_core::{BlobStore, EntryKind, FileData, Result, Score, unmarshal_listing};

/// One vertex of the score graph: a blob plus whether it is a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    pub score: Score,
    pub is_dir: bool,
}

impl Node {
    pub fn dir(score: Score) -> Self {
        Self {
            score,
            is_dir: true,
        }
    }

    pub fn file(score: Score) -> Self {
        Self {
            score,
            is_dir: false,
        }
    }

    /// Stable string form, used as the key of persisted structure maps.
    pub fn encode(&self) -> String {
        let tag = if self.is_dir { 'd' } else { 'f' };
        format!("{tag}:{}", self.score.to_hex())
    }

    pub fn parse(encoded: &str) -> Result<Self> {
        let (tag, hex) = encoded
            .split_once(':')
            .with_context(|| format!("malformed node {encoded:?}"))?;
        let is_dir = match tag {
            "d" => true,
            "f" => false,
            _ => bail!("malformed node tag in {encoded:?}"),
        };
        let score = hex
            .parse()
            .map_err(|e| anyhow::anyhow!("malformed node score in {encoded:?}: {e}"))?;
        Ok(Self { score, is_dir })
    }
}

/// Progress record emitted once per visited node.
#[derive(Debug, Clone)]
pub struct VisitRecord {
    pub node: Node,
    pub children: Vec<Node>,
    pub error: Option<String>,
}

/// The outcome of a full traversal.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub visited: usize,
    /// Nodes that failed, with the failure rendered for the user.
    pub errors: Vec<(Node, String)>,
    /// Every parent → children relation discovered; feed back in as
    /// `verified_structure` to make the next run incremental.
    pub structure: HashMap<String, Vec<Node>>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Encode, Decode)]
#[cbor(map)]
struct StructureSnapshot {
    #[n(0)]
    relations: Vec<StructureRecord>,
}

#[derive(Encode, Decode)]
#[cbor(map)]
struct StructureRecord {
    #[n(0)]
    parent: String,
    #[n(1)]
    children: Vec<String>,
}

/// Persist a verified structure map so the next run can skip the
/// subtrees this one proved.
pub fn save_structure(
    structure: &HashMap<String, Vec<Node>>,
    writer: &mut dyn Write,
) -> Result<()> {
    let mut relations: Vec<StructureRecord> = structure
        .iter()
        .map(|(parent, children)| StructureRecord {
            parent: parent.clone(),
            children: children.iter().map(Node::encode).collect(),
        })
        .collect();
    relations.sort_by(|a, b| a.parent.cmp(&b.parent));

    let encoded = minicbor::to_vec(StructureSnapshot { relations })
        .map_err(|e| anyhow::anyhow!("encoding structure: {e}"))?;
    writer.write_all(&encoded).context("writing structure")?;
    Ok(())
}

/// Load a structure map written by [`save_structure`].
pub fn load_structure(reader: &mut dyn Read) -> Result<HashMap<String, Vec<Node>>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("reading structure")?;
    let snapshot: StructureSnapshot =
        minicbor::decode(&buf).map_err(|e| anyhow::anyhow!("decoding structure: {e}"))?;

    let mut structure = HashMap::with_capacity(snapshot.relations.len());
    for record in snapshot.relations {
        let children = record
            .children
            .iter()
            .map(|encoded| Node::parse(encoded))
            .collect::<Result<Vec<Node>>>()
            .with_context(|| format!("structure entry {:?}", record.parent))?;
        structure.insert(record.parent, children);
    }
    Ok(structure)
}

pub struct Verifier {
    blobs: Arc<dyn BlobStore>,
    known: HashSet<Score>,
    verified_structure: HashMap<String, Vec<Node>>,
    read_files: bool,
    concurrency: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("known", &self.known.len())
            .field("read_files", &self.read_files)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        known: HashSet<Score>,
        verified_structure: HashMap<String, Vec<Node>>,
        read_files: bool,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            blobs,
            known,
            verified_structure,
            read_files,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Walk the graph from `roots`. Cancellation aborts the walk; node
    /// failures do not.
    pub async fn verify(
        &self,
        roots: Vec<Node>,
        progress: Option<mpsc::Sender<VisitRecord>>,
    ) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut seen: HashSet<Node> = HashSet::new();
        let mut frontier: Vec<Node> = Vec::new();

        for root in roots {
            if seen.insert(root) {
                frontier.push(root);
            }
        }

        while !frontier.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let wave: Vec<(Node, Result<Vec<Node>>)> = futures::stream::iter(frontier.drain(..))
                .map(|node| async move { (node, self.visit(node).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for (node, outcome) in wave {
                report.visited += 1;
                match outcome {
                    Ok(children) => {
                        if node.is_dir {
                            report.structure.insert(node.encode(), children.clone());
                        }
                        if let Some(progress) = &progress {
                            let _ = progress
                                .send(VisitRecord {
                                    node,
                                    children: children.clone(),
                                    error: None,
                                })
                                .await;
                        }
                        for child in children {
                            if seen.insert(child) {
                                frontier.push(child);
                            }
                        }
                    }
                    Err(err) if is_kind::<Cancelled>(&err) => return Err(err),
                    Err(err) => {
                        let rendered = format!("{err:#}");
                        tracing::warn!(node = %node.encode(), error = %rendered, "verification failure");
                        if let Some(progress) = &progress {
                            let _ = progress
                                .send(VisitRecord {
                                    node,
                                    children: Vec::new(),
                                    error: Some(rendered.clone()),
                                })
                                .await;
                        }
                        report.errors.push((node, rendered));
                    }
                }
            }
        }

        Ok(report)
    }

    async fn visit(&self, node: Node) -> Result<Vec<Node>> {
        // Subtrees proven in an earlier run are not re-walked.
        if self.verified_structure.contains_key(&node.encode()) {
            tracing::trace!(node = %node.encode(), "already verified");
            return Ok(Vec::new());
        }

        if !self.known.contains(&node.score) {
            bail!("unknown score {}", node.score);
        }

        if !node.is_dir {
            if self.read_files {
                self.blobs
                    .load(node.score)
                    .await
                    .with_context(|| format!("loading file blob {}", node.score))?;
            }
            return Ok(Vec::new());
        }

        let blob = self
            .blobs
            .load(node.score)
            .await
            .with_context(|| format!("loading listing {}", node.score))?;
        let entries = unmarshal_listing(&blob)
            .with_context(|| format!("parsing listing {}", node.score))?;

        let mut children = Vec::new();
        for entry in &entries {
            match &entry.kind {
                EntryKind::Directory { scores } => {
                    children.extend(scores.iter().map(|s| Node::dir(*s)));
                }
                EntryKind::File(FileData::Chunks(scores)) => {
                    children.extend(scores.iter().map(|s| Node::file(*s)));
                }
                // Hard links, symlinks, devices, and pipes carry no
                // scores; the listing decoder enforces that.
                _ => {}
            }
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backhaul_core::listing::Timespec;
    use backhaul_core::{Entry, marshal_listing};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct MapStore {
        blobs: Mutex<HashMap<Score, Bytes>>,
        loads: AtomicUsize,
    }

    impl MapStore {
        async fn put(&self, blob: Bytes) -> Score {
            BlobStore::store(self, blob).await.unwrap()
        }
        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlobStore for MapStore {
        async fn store(&self, blob: Bytes) -> Result<Score> {
            let score = Score::compute(&blob);
            self.blobs.lock().unwrap().insert(score, blob);
            Ok(score)
        }
        async fn load(&self, score: Score) -> Result<Bytes> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .lock()
                .unwrap()
                .get(&score)
                .cloned()
                .context("no such blob")
        }
        async fn contains(&self, score: Score) -> Result<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(&score))
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(name: &str, kind: EntryKind) -> Entry {
        Entry {
            name: name.to_string(),
            kind,
            permissions: 0o712,
            uid: 0,
            username: None,
            gid: 0,
            groupname: None,
            mtime: Timespec { sec: 0, nsec: 0 },
        }
    }

    fn verifier(
        store: Arc<MapStore>,
        known: HashSet<Score>,
        structure: HashMap<String, Vec<Node>>,
        read_files: bool,
    ) -> Verifier {
        Verifier::new(
            store,
            known,
            structure,
            read_files,
            4,
            CancellationToken::new(),
        )
    }

    /// One root listing holding a two-chunk file; traversal reaches both
    /// chunk nodes without loading them when read_files is off.
    #[tokio::test]
    async fn walks_file_chunks_without_reading_them() {
        let store = Arc::new(MapStore::default());
        let chunk_a = Score::compute(b"burrito");
        let chunk_b = Score::compute(b"enchilada");

        let listing = marshal_listing(&[entry(
            "taco",
            EntryKind::File(FileData::Chunks(vec![chunk_a, chunk_b])),
        )])
        .unwrap();
        let root = store.put(listing).await;

        let known = HashSet::from([root, chunk_a, chunk_b]);
        let report = verifier(store.clone(), known, HashMap::new(), false)
            .verify(vec![Node::dir(root)], None)
            .await
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.visited, 3);
        assert_eq!(store.load_count(), 1, "only the listing is loaded");
        assert_eq!(
            report.structure.get(&Node::dir(root).encode()).unwrap(),
            &vec![Node::file(chunk_a), Node::file(chunk_b)]
        );
    }

    #[tokio::test]
    async fn read_files_loads_every_chunk() {
        let store = Arc::new(MapStore::default());
        let chunk = store.put(Bytes::from_static(b"chunkf")).await;
        let listing = marshal_listing(&[entry(
            "taco",
            EntryKind::File(FileData::Chunks(vec![chunk])),
        )])
        .unwrap();
        let root = store.put(listing).await;

        let known = HashSet::from([root, chunk]);
        let report = verifier(store.clone(), known, HashMap::new(), true)
            .verify(vec![Node::dir(root)], None)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn unknown_scores_are_reported_not_fatal() {
        let store = Arc::new(MapStore::default());
        let missing = Score::compute(b"never stored");
        let present = store.put(Bytes::from_static(b"herex")).await;

        let listing = marshal_listing(&[
            entry("gone", EntryKind::File(FileData::Chunks(vec![missing]))),
            entry("here", EntryKind::File(FileData::Chunks(vec![present]))),
        ])
        .unwrap();
        let root = store.put(listing).await;

        // `missing` is not in the known set.
        let known = HashSet::from([root, present]);
        let report = verifier(store, known, HashMap::new(), false)
            .verify(vec![Node::dir(root)], None)
            .await
            .unwrap();

        assert_eq!(report.visited, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, Node::file(missing));
        assert!(report.errors[0].1.contains("unknown score"));
    }

    #[tokio::test]
    async fn nested_directories_traverse_and_report_structure() {
        let store = Arc::new(MapStore::default());
        let chunk = Score::compute(b"leaf");
        let inner = store
            .put(
                marshal_listing(&[entry(
                    "leaf",
                    EntryKind::File(FileData::Chunks(vec![chunk])),
                )])
                .unwrap(),
            )
            .await;
        let root = store
            .put(
                marshal_listing(&[entry(
                    "sub",
                    EntryKind::Directory {
                        scores: vec![inner],
                    },
                )])
                .unwrap(),
            )
            .await;

        let known = HashSet::from([root, inner, chunk]);
        let (tx, mut rx) = mpsc::channel(16);
        let report = verifier(store, known, HashMap::new(), false)
            .verify(vec![Node::dir(root)], Some(tx))
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.visited, 3);
        assert_eq!(report.structure.len(), 2);

        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn previously_verified_subtrees_are_skipped() {
        let store = Arc::new(MapStore::default());
        // The root references a listing that is NOT in the store; only
        // prior verification lets the walk succeed.
        let phantom = Score::compute(b"verified last week");
        let root = store
            .put(
                marshal_listing(&[entry(
                    "sub",
                    EntryKind::Directory {
                        scores: vec![phantom],
                    },
                )])
                .unwrap(),
            )
            .await;

        let structure =
            HashMap::from([(Node::dir(phantom).encode(), vec![Node::file(Score::EMPTY)])]);
        let known = HashSet::from([root, phantom]);
        let report = verifier(store, known, structure, false)
            .verify(vec![Node::dir(root)], None)
            .await
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.visited, 2);
    }

    #[tokio::test]
    async fn symlinks_with_scores_fail_the_listing() {
        let store = Arc::new(MapStore::default());

        // Hand-rolled listing: a symlink entry carrying a score, which
        // the entry types cannot express.
        let mut e = minicbor::Encoder::new(Vec::new());
        e.map(1).unwrap();
        e.u32(1).unwrap();
        e.array(1).unwrap();
        e.map(8).unwrap();
        e.u32(1).unwrap().i32(2).unwrap(); // type = symlink
        e.u32(2).unwrap().u32(0o777).unwrap();
        e.u32(3).unwrap().u32(0).unwrap();
        e.u32(5).unwrap().u32(0).unwrap();
        e.u32(7).unwrap().str("evil").unwrap();
        e.u32(8).unwrap();
        e.map(2).unwrap();
        e.u32(0).unwrap().i64(0).unwrap();
        e.u32(1).unwrap().u32(0).unwrap();
        e.u32(9).unwrap();
        e.array(1).unwrap();
        e.bytes(Score::EMPTY.as_bytes()).unwrap();
        e.u32(11).unwrap().str("target").unwrap();

        let mut payload = e.into_writer();
        payload.push(b'd');
        let root = store.put(Bytes::from(payload)).await;

        let known = HashSet::from([root]);
        let report = verifier(store, known, HashMap::new(), false)
            .verify(vec![Node::dir(root)], None)
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].1.contains("must not carry scores"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_walk() {
        let store = Arc::new(MapStore::default());
        let root = store.put(marshal_listing(&[]).unwrap()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let verifier = Verifier::new(
            store,
            HashSet::from([root]),
            HashMap::new(),
            false,
            2,
            cancel,
        );

        let err = verifier.verify(vec![Node::dir(root)], None).await.unwrap_err();
        assert!(is_kind::<Cancelled>(&err));
    }

    #[test]
    fn structure_round_trips_through_a_stream() {
        let structure = HashMap::from([
            (
                Node::dir(Score::compute(b"root")).encode(),
                vec![
                    Node::dir(Score::compute(b"sub")),
                    Node::file(Score::compute(b"chunk")),
                ],
            ),
            (Node::dir(Score::compute(b"sub")).encode(), vec![]),
        ]);

        let mut buf = Vec::new();
        save_structure(&structure, &mut buf).unwrap();
        let loaded = load_structure(&mut &buf[..]).unwrap();
        assert_eq!(loaded, structure);
    }

    #[test]
    fn corrupt_structure_is_an_error() {
        let mut garbage: &[u8] = b"not a snapshot";
        assert!(load_structure(&mut garbage).is_err());
    }

    #[test]
    fn node_encoding_round_trips() {
        let node = Node::dir(Score::compute(b"x"));
        assert_eq!(Node::parse(&node.encode()).unwrap(), node);
        let node = Node::file(Score::compute(b"y"));
        assert_eq!(Node::parse(&node.encode()).unwrap(), node);
        assert!(Node::parse("q:abcd").is_err());
        assert!(Node::parse("nocolon").is_err());
    }
}
