//! The restore walker.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use backhaul_core::error::{NotFound, is_kind};
use backhaul_core::{
    BlobStore, Entry, EntryKind, FileData, Result, Score, strip_chunk_tag, unmarshal_listing,
};
use backhaul_fs::{FileSystem, OwnerLookup};

/// Restores one directory tree below `join(base, rel)`, which must
/// already exist.
#[async_trait]
pub trait DirRestorer: Debug + Send + Sync + 'static {
    async fn restore_dir(&self, score: Score, base: &Path, rel: &Path) -> Result<()>;
}

/// Rebuilds one file from its chunk scores.
pub struct FileRestorer {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
}

impl Debug for FileRestorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRestorer").finish_non_exhaustive()
    }
}

impl FileRestorer {
    pub fn new(blobs: Arc<dyn BlobStore>, fs: Arc<dyn FileSystem>) -> Self {
        Self { blobs, fs }
    }

    /// Create `path` with `permissions` and write the chunks in order.
    pub async fn restore_file(
        &self,
        scores: &[Score],
        path: &Path,
        permissions: u32,
    ) -> Result<()> {
        let mut writer = self.fs.create_file(path, permissions).await?;
        for (index, score) in scores.iter().enumerate() {
            let blob = self
                .blobs
                .load(*score)
                .await
                .with_context(|| format!("loading chunk {index} of {path:?}"))?;
            let chunk = strip_chunk_tag(blob)
                .with_context(|| format!("chunk {index} of {path:?}"))?;
            writer
                .write_all(&chunk)
                .await
                .with_context(|| format!("writing {path:?}"))?;
        }
        writer
            .shutdown()
            .await
            .with_context(|| format!("closing {path:?}"))?;
        Ok(())
    }
}

/// Restores exactly one directory level; subdirectories go through the
/// wrapped restorer. [`TreeRestorer`] supplies the real recursion.
pub struct LevelRestorer {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
    owners: Arc<dyn OwnerLookup>,
    files: Arc<FileRestorer>,
    wrapped: Arc<dyn DirRestorer>,
}

impl Debug for LevelRestorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelRestorer").finish_non_exhaustive()
    }
}

impl LevelRestorer {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        fs: Arc<dyn FileSystem>,
        owners: Arc<dyn OwnerLookup>,
        files: Arc<FileRestorer>,
        wrapped: Arc<dyn DirRestorer>,
    ) -> Self {
        Self {
            blobs,
            fs,
            owners,
            files,
            wrapped,
        }
    }

    /// Prefer the symbolic name; fall back to the saved numeric id when
    /// the name is unknown here. Anything else is fatal.
    async fn resolve_uid(&self, entry: &Entry) -> Result<u32> {
        match &entry.username {
            Some(name) => match self.owners.uid_for(name).await {
                Ok(uid) => Ok(uid),
                Err(err) if is_kind::<NotFound>(&err) => Ok(entry.uid),
                Err(err) => Err(err.context(format!("resolving owner of {:?}", entry.name))),
            },
            None => Ok(entry.uid),
        }
    }

    async fn resolve_gid(&self, entry: &Entry) -> Result<u32> {
        match &entry.groupname {
            Some(name) => match self.owners.gid_for(name).await {
                Ok(gid) => Ok(gid),
                Err(err) if is_kind::<NotFound>(&err) => Ok(entry.gid),
                Err(err) => Err(err.context(format!("resolving group of {:?}", entry.name))),
            },
            None => Ok(entry.gid),
        }
    }

    async fn restore_entry(&self, entry: &Entry, base: &Path, rel: &Path) -> Result<()> {
        let entry_rel = rel.join(&entry.name);
        let path = base.join(&entry_rel);

        let is_device = matches!(
            entry.kind,
            EntryKind::BlockDevice { .. } | EntryKind::CharDevice { .. }
        );

        match &entry.kind {
            EntryKind::File(FileData::HardLink(target)) => {
                if target.is_empty() {
                    bail!("file entry {:?} has an empty hard link target", entry.name);
                }
                self.fs.create_hard_link(&base.join(target), &path).await?;
            }
            EntryKind::File(FileData::Chunks(scores)) => {
                self.files
                    .restore_file(scores, &path, entry.permissions)
                    .await?;
            }
            EntryKind::Directory { scores } => {
                if scores.len() != 1 {
                    bail!(
                        "directory entry must have exactly one score, got {} for {:?}",
                        scores.len(),
                        entry.name
                    );
                }
                self.fs.mkdir(&path, entry.permissions).await?;
                self.wrapped
                    .restore_dir(scores[0], base, &entry_rel)
                    .await?;
            }
            EntryKind::Symlink { target } => {
                self.fs
                    .create_symlink(target, &path, entry.permissions)
                    .await?;
            }
            EntryKind::NamedPipe => {
                self.fs.create_named_pipe(&path, entry.permissions).await?;
            }
            EntryKind::BlockDevice { device } => {
                self.fs
                    .create_block_device(&path, entry.permissions, *device)
                    .await?;
            }
            EntryKind::CharDevice { device } => {
                self.fs
                    .create_char_device(&path, entry.permissions, *device)
                    .await?;
            }
        }

        let uid = self.resolve_uid(entry).await?;
        let gid = self.resolve_gid(entry).await?;
        self.fs
            .chown(&path, uid, gid)
            .await
            .with_context(|| format!("chown {path:?}"))?;

        if !is_device {
            self.fs
                .set_mtime(&path, entry.mtime)
                .await
                .with_context(|| format!("setting mtime of {path:?}"))?;
        }

        Ok(())
    }
}

#[async_trait]
impl DirRestorer for LevelRestorer {
    async fn restore_dir(&self, score: Score, base: &Path, rel: &Path) -> Result<()> {
        let blob = self
            .blobs
            .load(score)
            .await
            .with_context(|| format!("loading listing {score}"))?;
        let entries = unmarshal_listing(&blob)?;

        for entry in &entries {
            self.restore_entry(entry, base, rel)
                .await
                .with_context(|| format!("restoring {:?}", rel.join(&entry.name)))?;
        }
        Ok(())
    }
}

/// The recursive restorer: a fresh [`LevelRestorer`] per call, wired back
/// to itself for subdirectories.
#[derive(Clone)]
pub struct TreeRestorer {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
    owners: Arc<dyn OwnerLookup>,
}

impl Debug for TreeRestorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeRestorer").finish_non_exhaustive()
    }
}

impl TreeRestorer {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        fs: Arc<dyn FileSystem>,
        owners: Arc<dyn OwnerLookup>,
    ) -> Self {
        Self { blobs, fs, owners }
    }
}

#[async_trait]
impl DirRestorer for TreeRestorer {
    async fn restore_dir(&self, score: Score, base: &Path, rel: &Path) -> Result<()> {
        let files = Arc::new(FileRestorer::new(
            Arc::clone(&self.blobs),
            Arc::clone(&self.fs),
        ));
        let level = LevelRestorer::new(
            Arc::clone(&self.blobs),
            Arc::clone(&self.fs),
            Arc::clone(&self.owners),
            files,
            Arc::new(self.clone()),
        );
        level.restore_dir(score, base, rel).await
    }
}
