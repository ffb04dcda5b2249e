//! The filesystem seam.
//!
//! The walker and the restorer never touch the disk directly; they go
//! through [`FileSystem`] so that one directory level is testable against
//! a fake. [`LocalFileSystem`] is the real POSIX-backed implementation.

mod local;

pub use local::{LocalFileSystem, LocalOwnerLookup};

use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use backhaul_core::Result;
use backhaul_core::listing::{MODE_SETGID, MODE_SETUID, MODE_STICKY, Timespec};

/// What kind of node a stat found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
    Unknown,
}

/// Everything the engine wants to know about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component.
    pub name: String,
    pub file_type: FileType,
    /// rwx bits plus setuid/setgid/sticky, in the listing's packed layout.
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Timespec,
    pub size: u64,
    /// Inode number, for hard-link detection.
    pub inode: u64,
    /// Device of the filesystem containing this node.
    pub containing_device: u64,
    /// For device nodes, the referenced device number.
    pub device_number: i32,
    /// For symlinks, the link target.
    pub symlink_target: Option<String>,
}

/// Narrow interface onto the syscall layer.
///
/// `stat` and `read_dir` do not follow symlinks. `read_dir` returns
/// entries sorted by name so listings are deterministic.
#[async_trait]
pub trait FileSystem: Debug + Send + Sync + 'static {
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    async fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>>;

    async fn open_for_reading(&self, path: &Path)
    -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Create (or truncate) a regular file with the given packed
    /// permissions, open for writing.
    async fn create_file(
        &self,
        path: &Path,
        permissions: u32,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    async fn mkdir(&self, path: &Path, permissions: u32) -> Result<()>;

    async fn create_symlink(&self, target: &str, path: &Path, permissions: u32) -> Result<()>;

    async fn create_hard_link(&self, existing: &Path, path: &Path) -> Result<()>;

    async fn create_named_pipe(&self, path: &Path, permissions: u32) -> Result<()>;

    async fn create_block_device(&self, path: &Path, permissions: u32, device: i32) -> Result<()>;

    async fn create_char_device(&self, path: &Path, permissions: u32, device: i32) -> Result<()>;

    /// Change ownership without following a final symlink.
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Set the modification time without following a final symlink.
    async fn set_mtime(&self, path: &Path, mtime: Timespec) -> Result<()>;
}

/// Resolution between numeric ids and symbolic names.
///
/// Lookups by name return the [`NotFound`](backhaul_core::error::NotFound)
/// kind when the name is unknown; the restorer falls back to the numeric
/// id in that case and aborts on anything else.
#[async_trait]
pub trait OwnerLookup: Debug + Send + Sync + 'static {
    async fn username(&self, uid: u32) -> Result<Option<String>>;
    async fn groupname(&self, gid: u32) -> Result<Option<String>>;
    async fn uid_for(&self, username: &str) -> Result<u32>;
    async fn gid_for(&self, groupname: &str) -> Result<u32>;
}

/// Pack a host `st_mode` into the listing's permission layout.
pub fn pack_mode(mode: u32) -> u32 {
    let mut packed = mode & 0o777;
    if mode & 0o4000 != 0 {
        packed |= MODE_SETUID;
    }
    if mode & 0o2000 != 0 {
        packed |= MODE_SETGID;
    }
    if mode & 0o1000 != 0 {
        packed |= MODE_STICKY;
    }
    packed
}

/// Unpack listing permissions back into host mode bits.
pub fn unpack_mode(packed: u32) -> u32 {
    let mut mode = packed & 0o777;
    if packed & MODE_SETUID != 0 {
        mode |= 0o4000;
    }
    if packed & MODE_SETGID != 0 {
        mode |= 0o2000;
    }
    if packed & MODE_STICKY != 0 {
        mode |= 0o1000;
    }
    mode
}
