//! End-to-end save → restore over the full blob stack.
//!
//! Builds a real tree on disk, saves it through the layered store into an
//! in-memory object store, then restores into a second directory and
//! compares. Exercises the walker, the chunking file saver, hard-link
//! detection, the stack (encryption, buffering, dedup, checking), and the
//! restore walker together.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashSet;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use backhaul_backup::{DirRestorer, DirSaver, FileSaver, TreeRestorer, TreeSaver};
use backhaul_blobs::{StackConfig, build};
use backhaul_core::{BlobStore, Crypter, Result, Score};
use backhaul_fs::{FileSystem, FileType, LocalFileSystem, LocalOwnerLookup};
use backhaul_store_memory::MemoryObjectStore;

/// Deterministic stand-in crypter; the real one lives in the registry
/// crate and is wired in by the CLI.
#[derive(Debug)]
struct XorCrypter;

impl Crypter for XorCrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = plaintext.iter().map(|b| b ^ 0x5a).collect();
        out.extend_from_slice(b"mac...");
        Ok(out)
    }
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let Some(payload) = ciphertext.strip_suffix(b"mac...") else {
            return Err(backhaul_core::NotAuthentic.into());
        };
        Ok(payload.iter().map(|b| b ^ 0x5a).collect())
    }
}

fn stack(objects: Arc<MemoryObjectStore>) -> (Arc<dyn BlobStore>, Arc<DashSet<Score>>) {
    let existing = Arc::new(DashSet::new());
    let store = build(
        objects,
        Arc::new(XorCrypter),
        existing.clone(),
        StackConfig {
            prefix: "blobs/".to_string(),
            max_buffered_bytes: 1 << 20,
            max_requests_in_flight: 4,
        },
        CancellationToken::new(),
    );
    (store, existing)
}

async fn build_source(dir: &Path) {
    tokio::fs::create_dir(dir.join("queso")).await.unwrap();
    tokio::fs::write(dir.join("queso/burrito"), b"carnitas y frijoles")
        .await
        .unwrap();
    tokio::fs::write(dir.join("beans"), vec![7u8; 10_000])
        .await
        .unwrap();
    tokio::fs::write(dir.join("empty"), b"").await.unwrap();
    tokio::fs::hard_link(dir.join("beans"), dir.join("beans-twin"))
        .await
        .unwrap();
    tokio::fs::symlink("beans", dir.join("alias")).await.unwrap();
    tokio::fs::create_dir(dir.join("skipme")).await.unwrap();
    tokio::fs::write(dir.join("skipme/secret"), b"do not back up")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn save_then_restore_reproduces_the_tree() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_source(src.path()).await;

    let objects = Arc::new(MemoryObjectStore::new());
    let (blobs, existing) = stack(objects.clone());
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let owners = Arc::new(LocalOwnerLookup::new());

    // Small chunks so multi-chunk files are exercised.
    let files = Arc::new(FileSaver::new(blobs.clone(), fs.clone(), 4096, 3).unwrap());
    let saver = TreeSaver::new(blobs.clone(), fs.clone(), owners.clone(), files);

    let excludes = vec![Regex::new("^skipme").unwrap()];
    let root = saver
        .save_dir(src.path(), Path::new(""), &excludes)
        .await
        .unwrap();
    blobs.flush().await.unwrap();

    assert!(!existing.is_empty());
    assert!(objects.len() > 0);

    let restorer = TreeRestorer::new(blobs.clone(), fs.clone(), owners);
    restorer
        .restore_dir(root, dst.path(), Path::new(""))
        .await
        .unwrap();

    // Contents round-trip.
    let burrito = tokio::fs::read(dst.path().join("queso/burrito")).await.unwrap();
    assert_eq!(burrito, b"carnitas y frijoles");
    let beans = tokio::fs::read(dst.path().join("beans")).await.unwrap();
    assert_eq!(beans, vec![7u8; 10_000]);
    let empty = tokio::fs::read(dst.path().join("empty")).await.unwrap();
    assert!(empty.is_empty());

    // The symlink is a symlink with the same target.
    let target = tokio::fs::read_link(dst.path().join("alias")).await.unwrap();
    assert_eq!(target, Path::new("beans"));

    // The hard link shares an inode with its first-seen sibling.
    let a = fs.stat(&dst.path().join("beans")).await.unwrap();
    let b = fs.stat(&dst.path().join("beans-twin")).await.unwrap();
    assert_eq!(a.inode, b.inode);

    // Excluded subtree never arrived.
    assert!(!dst.path().join("skipme").exists());

    // Mtimes round-trip at nanosecond precision.
    let src_stat = fs.stat(&src.path().join("queso/burrito")).await.unwrap();
    let dst_stat = fs.stat(&dst.path().join("queso/burrito")).await.unwrap();
    assert_eq!(src_stat.mtime, dst_stat.mtime);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_save_of_unchanged_tree_uploads_nothing() {
    let src = tempfile::tempdir().unwrap();
    build_source(src.path()).await;

    let objects = Arc::new(MemoryObjectStore::new());
    let (blobs, _) = stack(objects.clone());
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let owners = Arc::new(LocalOwnerLookup::new());
    let files = Arc::new(FileSaver::new(blobs.clone(), fs.clone(), 4096, 2).unwrap());

    let saver = TreeSaver::new(blobs.clone(), fs.clone(), owners.clone(), files.clone());
    let first = saver.save_dir(src.path(), Path::new(""), &[]).await.unwrap();
    blobs.flush().await.unwrap();
    let puts_after_first = objects.put_count();

    // A fresh walker (fresh link resolver), same stack: everything
    // deduplicates against the existing-scores set.
    let saver = TreeSaver::new(blobs.clone(), fs, owners, files);
    let second = saver.save_dir(src.path(), Path::new(""), &[]).await.unwrap();
    blobs.flush().await.unwrap();

    assert_eq!(first, second, "same tree, same root score");
    assert_eq!(objects.put_count(), puts_after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restore_into_missing_parent_fails() {
    let src = tempfile::tempdir().unwrap();
    tokio::fs::write(src.path().join("taco"), b"x").await.unwrap();

    let objects = Arc::new(MemoryObjectStore::new());
    let (blobs, _) = stack(objects);
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    let owners = Arc::new(LocalOwnerLookup::new());
    let files = Arc::new(FileSaver::new(blobs.clone(), fs.clone(), 4096, 2).unwrap());

    let saver = TreeSaver::new(blobs.clone(), fs.clone(), owners.clone(), files);
    let root = saver.save_dir(src.path(), Path::new(""), &[]).await.unwrap();
    blobs.flush().await.unwrap();

    let restorer = TreeRestorer::new(blobs, fs, owners);
    let err = restorer
        .restore_dir(root, Path::new("/definitely/not/here"), Path::new(""))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("taco"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn named_pipes_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new());
    fs.create_named_pipe(&src.path().join("fifo"), 0o640)
        .await
        .unwrap();

    let objects = Arc::new(MemoryObjectStore::new());
    let (blobs, _) = stack(objects);
    let owners = Arc::new(LocalOwnerLookup::new());
    let files = Arc::new(FileSaver::new(blobs.clone(), fs.clone(), 4096, 2).unwrap());

    let saver = TreeSaver::new(blobs.clone(), fs.clone(), owners.clone(), files);
    let root = saver.save_dir(src.path(), Path::new(""), &[]).await.unwrap();
    blobs.flush().await.unwrap();

    let restorer = TreeRestorer::new(blobs, fs.clone(), owners);
    restorer
        .restore_dir(root, dst.path(), Path::new(""))
        .await
        .unwrap();

    let info = fs.stat(&dst.path().join("fifo")).await.unwrap();
    assert_eq!(info.file_type, FileType::NamedPipe);
    assert_eq!(info.permissions & 0o777, 0o640);
}
