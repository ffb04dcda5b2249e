//! POSIX-backed [`FileSystem`] and [`OwnerLookup`].

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use nix::sys::stat::{Mode, SFlag, mknod};
use nix::unistd::{Gid, Group, Uid, User, mkfifo};
use tokio::io::{AsyncRead, AsyncWrite};

use backhaul_core::Result;
use backhaul_core::error::NotFound;
use backhaul_core::listing::Timespec;

use crate::{FileInfo, FileSystem, FileType, OwnerLookup, pack_mode, unpack_mode};

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn file_type_of(meta: &std::fs::Metadata) -> FileType {
    use std::os::unix::fs::FileTypeExt;

    let ft = meta.file_type();
    if ft.is_file() {
        FileType::File
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::Unknown
    }
}

async fn info_for(path: &Path, name: String) -> Result<FileInfo> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("stat {path:?}"))?;

    let file_type = file_type_of(&meta);
    let symlink_target = if file_type == FileType::Symlink {
        let target = tokio::fs::read_link(path)
            .await
            .with_context(|| format!("readlink {path:?}"))?;
        Some(
            target
                .to_str()
                .with_context(|| format!("symlink target of {path:?} is not UTF-8"))?
                .to_string(),
        )
    } else {
        None
    };

    Ok(FileInfo {
        name,
        file_type,
        permissions: pack_mode(meta.mode()),
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: Timespec {
            sec: meta.mtime(),
            nsec: meta.mtime_nsec() as u32,
        },
        size: meta.len(),
        inode: meta.ino(),
        containing_device: meta.dev(),
        device_number: meta.rdev() as i32,
        symlink_target,
    })
}

/// Set a path's mtime without following a final symlink. Uses utimensat
/// directly; the atime is left untouched.
fn lutimens(path: &Path, mtime: Timespec) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: mtime.sec as libc::time_t,
            tv_nsec: mtime.nsec as libc::c_long,
        },
    ];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info_for(path, name).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FileInfo>> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("opening directory {path:?}"))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("reading directory {path:?}"))?
        {
            let name = entry
                .file_name()
                .to_str()
                .with_context(|| format!("entry name in {path:?} is not UTF-8"))?
                .to_string();
            entries.push(info_for(&entry.path(), name).await?);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_for_reading(
        &self,
        path: &Path,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {path:?}"))?;
        Ok(Box::new(file))
    }

    async fn create_file(
        &self,
        path: &Path,
        permissions: u32,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(unpack_mode(permissions))
            .open(path)
            .await
            .with_context(|| format!("creating {path:?}"))?;
        // The open mode is filtered through the umask; apply the exact
        // bits afterwards.
        chmod_exact(path, permissions).await?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &Path, permissions: u32) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(unpack_mode(permissions));
        builder
            .create(path)
            .await
            .with_context(|| format!("mkdir {path:?}"))?;
        chmod_exact(path, permissions).await
    }

    async fn create_symlink(&self, target: &str, path: &Path, _permissions: u32) -> Result<()> {
        // Symlink permissions are fixed on Linux; the mode argument is
        // accepted for interface symmetry and ignored here.
        tokio::fs::symlink(target, path)
            .await
            .with_context(|| format!("symlink {path:?} -> {target:?}"))
    }

    async fn create_hard_link(&self, existing: &Path, path: &Path) -> Result<()> {
        tokio::fs::hard_link(existing, path)
            .await
            .with_context(|| format!("hard link {path:?} -> {existing:?}"))
    }

    async fn create_named_pipe(&self, path: &Path, permissions: u32) -> Result<()> {
        let fifo_path = path.to_path_buf();
        let mode = Mode::from_bits_truncate(unpack_mode(permissions));
        tokio::task::spawn_blocking(move || mkfifo(&fifo_path, mode))
            .await?
            .with_context(|| format!("mkfifo {path:?}"))?;
        chmod_exact(path, permissions).await
    }

    async fn create_block_device(&self, path: &Path, permissions: u32, device: i32) -> Result<()> {
        make_device(path.to_path_buf(), SFlag::S_IFBLK, permissions, device).await
    }

    async fn create_char_device(&self, path: &Path, permissions: u32, device: i32) -> Result<()> {
        make_device(path.to_path_buf(), SFlag::S_IFCHR, permissions, device).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::os::unix::fs::lchown(&path, Some(uid), Some(gid))
                .with_context(|| format!("chown {path:?}"))
        })
        .await?
    }

    async fn set_mtime(&self, path: &Path, mtime: Timespec) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            lutimens(&path, mtime).with_context(|| format!("setting mtime of {path:?}"))
        })
        .await?
    }
}

async fn make_device(path: PathBuf, kind: SFlag, permissions: u32, device: i32) -> Result<()> {
    let mode = Mode::from_bits_truncate(unpack_mode(permissions));
    let node_path = path.clone();
    tokio::task::spawn_blocking(move || {
        mknod(&node_path, kind, mode, device as u32 as nix::libc::dev_t)
            .with_context(|| format!("mknod {node_path:?}"))
    })
    .await??;
    chmod_exact(&path, permissions).await
}

/// Apply permission bits exactly, undoing whatever the umask filtered.
async fn chmod_exact(path: &Path, permissions: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(unpack_mode(permissions)))
        .await
        .with_context(|| format!("chmod {path:?}"))
}

/// Owner resolution through the system user and group databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOwnerLookup;

impl LocalOwnerLookup {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OwnerLookup for LocalOwnerLookup {
    async fn username(&self, uid: u32) -> Result<Option<String>> {
        tokio::task::spawn_blocking(move || {
            let user = User::from_uid(Uid::from_raw(uid)).context("looking up uid")?;
            Ok(user.map(|u| u.name))
        })
        .await?
    }

    async fn groupname(&self, gid: u32) -> Result<Option<String>> {
        tokio::task::spawn_blocking(move || {
            let group = Group::from_gid(Gid::from_raw(gid)).context("looking up gid")?;
            Ok(group.map(|g| g.name))
        })
        .await?
    }

    async fn uid_for(&self, username: &str) -> Result<u32> {
        let username = username.to_string();
        tokio::task::spawn_blocking(move || {
            match User::from_name(&username).context("looking up user")? {
                Some(user) => Ok(user.uid.as_raw()),
                None => Err(anyhow::Error::new(NotFound)
                    .context(format!("no user named {username:?}"))),
            }
        })
        .await?
    }

    async fn gid_for(&self, groupname: &str) -> Result<u32> {
        let groupname = groupname.to_string();
        tokio::task::spawn_blocking(move || {
            match Group::from_name(&groupname).context("looking up group")? {
                Some(group) => Ok(group.gid.as_raw()),
                None => Err(anyhow::Error::new(NotFound)
                    .context(format!("no group named {groupname:?}"))),
            }
        })
        .await?
    }
}
