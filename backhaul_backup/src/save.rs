//! The directory walker.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use regex::Regex;

use backhaul_core::{BlobStore, Entry, EntryKind, FileData, Result, Score, marshal_listing};
use backhaul_fs::{FileInfo, FileSystem, FileType, OwnerLookup};

use crate::chunker::PathSaver;
use crate::links::LinkResolver;

/// Saves one directory tree rooted at `join(base, rel)` and returns the
/// score of its listing blob.
#[async_trait]
pub trait DirSaver: Debug + Send + Sync + 'static {
    async fn save_dir(&self, base: &Path, rel: &Path, exclusions: &[Regex]) -> Result<Score>;
}

/// Saves exactly one directory level.
///
/// Subdirectories go through the `wrapped` saver rather than direct
/// recursion, so a single level can be exercised with a stub in its
/// place. [`TreeSaver`] supplies the real recursion.
pub struct LevelSaver {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
    owners: Arc<dyn OwnerLookup>,
    files: Arc<dyn PathSaver>,
    links: Arc<LinkResolver>,
    wrapped: Arc<dyn DirSaver>,
}

impl Debug for LevelSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelSaver").finish_non_exhaustive()
    }
}

impl LevelSaver {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        fs: Arc<dyn FileSystem>,
        owners: Arc<dyn OwnerLookup>,
        files: Arc<dyn PathSaver>,
        links: Arc<LinkResolver>,
        wrapped: Arc<dyn DirSaver>,
    ) -> Self {
        Self {
            blobs,
            fs,
            owners,
            files,
            links,
            wrapped,
        }
    }

    async fn entry_for(
        &self,
        base: &Path,
        rel: &Path,
        info: FileInfo,
        exclusions: &[Regex],
    ) -> Result<Entry> {
        let entry_rel = rel.join(&info.name);
        let rel_str = entry_rel.to_string_lossy().into_owned();

        let kind = match info.file_type {
            FileType::File => {
                match self
                    .links
                    .register(info.containing_device, info.inode, &rel_str)
                {
                    Some(first_path) => EntryKind::File(FileData::HardLink(first_path)),
                    None => {
                        let scores = self
                            .files
                            .save_path(&base.join(&entry_rel))
                            .await
                            .with_context(|| format!("saving file {rel_str:?}"))?;
                        EntryKind::File(FileData::Chunks(scores))
                    }
                }
            }
            FileType::Directory => {
                let score = self.wrapped.save_dir(base, &entry_rel, exclusions).await?;
                EntryKind::Directory {
                    scores: vec![score],
                }
            }
            FileType::Symlink => EntryKind::Symlink {
                target: info
                    .symlink_target
                    .with_context(|| format!("symlink {rel_str:?} has no target"))?,
            },
            FileType::BlockDevice => EntryKind::BlockDevice {
                device: info.device_number,
            },
            FileType::CharDevice => EntryKind::CharDevice {
                device: info.device_number,
            },
            FileType::NamedPipe => EntryKind::NamedPipe,
            other => bail!("unhandled type: {other:?} for {rel_str:?}"),
        };

        // Symbolic names are best effort; a failed lookup stores the
        // numeric id alone.
        let username = self.owners.username(info.uid).await.unwrap_or_default();
        let groupname = self.owners.groupname(info.gid).await.unwrap_or_default();

        Ok(Entry {
            name: info.name,
            kind,
            permissions: info.permissions,
            uid: info.uid,
            username,
            gid: info.gid,
            groupname,
            mtime: info.mtime,
        })
    }
}

#[async_trait]
impl DirSaver for LevelSaver {
    async fn save_dir(&self, base: &Path, rel: &Path, exclusions: &[Regex]) -> Result<Score> {
        let dir_path = base.join(rel);
        let infos = self
            .fs
            .read_dir(&dir_path)
            .await
            .with_context(|| format!("listing directory {dir_path:?}"))?;

        let mut entries = Vec::with_capacity(infos.len());
        for info in infos {
            let entry_rel = rel.join(&info.name);
            let rel_str = entry_rel.to_string_lossy();
            if exclusions.iter().any(|re| re.is_match(&rel_str)) {
                tracing::debug!(path = %rel_str, "excluded");
                continue;
            }
            entries.push(self.entry_for(base, rel, info, exclusions).await?);
        }

        let blob = marshal_listing(&entries)?;
        self.blobs
            .store(blob)
            .await
            .with_context(|| format!("storing listing for {rel:?}"))
    }
}

/// The recursive saver: builds a fresh [`LevelSaver`] per call, wired
/// back to itself for subdirectories.
#[derive(Clone)]
pub struct TreeSaver {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
    owners: Arc<dyn OwnerLookup>,
    files: Arc<dyn PathSaver>,
    links: Arc<LinkResolver>,
}

impl Debug for TreeSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeSaver").finish_non_exhaustive()
    }
}

impl TreeSaver {
    /// The link resolver is per-run state: construct one `TreeSaver` per
    /// backup run.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        fs: Arc<dyn FileSystem>,
        owners: Arc<dyn OwnerLookup>,
        files: Arc<dyn PathSaver>,
    ) -> Self {
        Self {
            blobs,
            fs,
            owners,
            files,
            links: Arc::new(LinkResolver::new()),
        }
    }
}

#[async_trait]
impl DirSaver for TreeSaver {
    async fn save_dir(&self, base: &Path, rel: &Path, exclusions: &[Regex]) -> Result<Score> {
        let level = LevelSaver::new(
            Arc::clone(&self.blobs),
            Arc::clone(&self.fs),
            Arc::clone(&self.owners),
            Arc::clone(&self.files),
            Arc::clone(&self.links),
            Arc::new(self.clone()),
        );
        level.save_dir(base, rel, exclusions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_core::unmarshal_listing;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Blob store retaining everything in a map, for direct inspection.
    #[derive(Debug, Default)]
    struct MapStore {
        blobs: Mutex<HashMap<Score, Bytes>>,
    }

    #[async_trait]
    impl BlobStore for MapStore {
        async fn store(&self, blob: Bytes) -> Result<Score> {
            let score = Score::compute(&blob);
            self.blobs.lock().unwrap().insert(score, blob);
            Ok(score)
        }
        async fn load(&self, score: Score) -> Result<Bytes> {
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

    /// Owner lookup with a fixed table.
    #[derive(Debug)]
    struct FixedOwners;

    #[async_trait]
    impl OwnerLookup for FixedOwners {
        async fn username(&self, uid: u32) -> Result<Option<String>> {
            Ok((uid == 1000).then(|| "jose".to_string()))
        }
        async fn groupname(&self, _gid: u32) -> Result<Option<String>> {
            Ok(None)
        }
        async fn uid_for(&self, _username: &str) -> Result<u32> {
            unreachable!()
        }
        async fn gid_for(&self, _groupname: &str) -> Result<u32> {
            unreachable!()
        }
    }

    /// Path saver that returns canned scores without touching any store.
    #[derive(Debug, Default)]
    struct CannedSaver {
        saved: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PathSaver for CannedSaver {
        async fn save_path(&self, path: &Path) -> Result<Vec<Score>> {
            self.saved
                .lock()
                .unwrap()
                .push(path.to_string_lossy().into_owned());
            Ok(vec![Score::compute(path.to_string_lossy().as_bytes())])
        }
    }

    /// A wrapped dir saver that records calls and returns a fixed score,
    /// proving one level runs without live recursion.
    #[derive(Debug, Default)]
    struct StubDirSaver {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DirSaver for StubDirSaver {
        async fn save_dir(&self, _base: &Path, rel: &Path, _exclusions: &[Regex]) -> Result<Score> {
            self.calls
                .lock()
                .unwrap()
                .push(rel.to_string_lossy().into_owned());
            Ok(Score::compute(b"subdir"))
        }
    }

    async fn make_tree(dir: &Path) {
        tokio::fs::write(dir.join("beans"), b"pinto").await.unwrap();
        tokio::fs::create_dir(dir.join("fillings")).await.unwrap();
        tokio::fs::write(dir.join("fillings/carnitas"), b"pork")
            .await
            .unwrap();
        tokio::fs::symlink("beans", dir.join("alias")).await.unwrap();
    }

    #[tokio::test]
    async fn one_level_uses_the_wrapped_saver() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path()).await;

        let blobs = Arc::new(MapStore::default());
        let files = Arc::new(CannedSaver::default());
        let wrapped = Arc::new(StubDirSaver::default());
        let level = LevelSaver::new(
            blobs.clone(),
            Arc::new(backhaul_fs::LocalFileSystem::new()),
            Arc::new(FixedOwners),
            files.clone(),
            Arc::new(LinkResolver::new()),
            wrapped.clone(),
        );

        let score = level
            .save_dir(tmp.path(), Path::new(""), &[])
            .await
            .unwrap();

        // The subdirectory went through the stub, not real recursion.
        assert_eq!(&*wrapped.calls.lock().unwrap(), &["fillings".to_string()]);

        let entries = unmarshal_listing(&blobs.load(score).await.unwrap()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alias", "beans", "fillings"]);

        assert_eq!(
            entries[2].kind,
            EntryKind::Directory {
                scores: vec![Score::compute(b"subdir")]
            }
        );
        assert!(matches!(
            &entries[0].kind,
            EntryKind::Symlink { target } if target == "beans"
        ));
    }

    #[tokio::test]
    async fn tree_saver_recurses_and_nests_scores() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path()).await;

        let blobs = Arc::new(MapStore::default());
        let saver = TreeSaver::new(
            blobs.clone(),
            Arc::new(backhaul_fs::LocalFileSystem::new()),
            Arc::new(FixedOwners),
            Arc::new(CannedSaver::default()),
        );

        let root = saver
            .save_dir(tmp.path(), Path::new(""), &[])
            .await
            .unwrap();

        let entries = unmarshal_listing(&blobs.load(root).await.unwrap()).unwrap();
        let dir_entry = entries.iter().find(|e| e.name == "fillings").unwrap();
        let EntryKind::Directory { scores } = &dir_entry.kind else {
            panic!("fillings is not a directory entry");
        };
        assert_eq!(scores.len(), 1);

        let child = unmarshal_listing(&blobs.load(scores[0]).await.unwrap()).unwrap();
        assert_eq!(child.len(), 1);
        assert_eq!(child[0].name, "carnitas");
        assert!(matches!(
            &child[0].kind,
            EntryKind::File(FileData::Chunks(scores)) if scores.len() == 1
        ));
    }

    #[tokio::test]
    async fn exclusions_match_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        make_tree(tmp.path()).await;

        let blobs = Arc::new(MapStore::default());
        let files = Arc::new(CannedSaver::default());
        let saver = TreeSaver::new(
            blobs.clone(),
            Arc::new(backhaul_fs::LocalFileSystem::new()),
            Arc::new(FixedOwners),
            files.clone(),
        );

        let root = saver
            .save_dir(
                tmp.path(),
                Path::new(""),
                &[Regex::new(r"^fillings/carnitas$").unwrap()],
            )
            .await
            .unwrap();

        // The excluded file was never saved.
        assert!(files.saved.lock().unwrap().iter().all(|p| !p.contains("carnitas")));

        let entries = unmarshal_listing(&blobs.load(root).await.unwrap()).unwrap();
        let dir_entry = entries.iter().find(|e| e.name == "fillings").unwrap();
        let EntryKind::Directory { scores } = &dir_entry.kind else {
            panic!();
        };
        let child = unmarshal_listing(&blobs.load(scores[0]).await.unwrap()).unwrap();
        assert!(child.is_empty());
    }

    #[tokio::test]
    async fn second_hard_link_records_the_first_path() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("original"), b"pinto")
            .await
            .unwrap();
        tokio::fs::hard_link(tmp.path().join("original"), tmp.path().join("twin"))
            .await
            .unwrap();

        let blobs = Arc::new(MapStore::default());
        let saver = TreeSaver::new(
            blobs.clone(),
            Arc::new(backhaul_fs::LocalFileSystem::new()),
            Arc::new(FixedOwners),
            Arc::new(CannedSaver::default()),
        );

        let root = saver
            .save_dir(tmp.path(), Path::new(""), &[])
            .await
            .unwrap();
        let entries = unmarshal_listing(&blobs.load(root).await.unwrap()).unwrap();

        // read_dir sorts by name, so "original" registers first.
        let twin = entries.iter().find(|e| e.name == "twin").unwrap();
        assert_eq!(
            twin.kind,
            EntryKind::File(FileData::HardLink("original".to_string()))
        );
        let original = entries.iter().find(|e| e.name == "original").unwrap();
        assert!(matches!(
            &original.kind,
            EntryKind::File(FileData::Chunks(scores)) if !scores.is_empty()
        ));
    }
}
