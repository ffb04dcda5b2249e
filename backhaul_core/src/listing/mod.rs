//! Directory listings: the saved contents of one directory.
//!
//! A listing is an ordered sequence of entries, one per directory child.
//! Entries are a discriminated sum over the entry type so that invalid
//! field combinations (scores on a symlink, a hard-link target on a
//! directory) cannot be constructed.

mod wire;

pub use wire::{marshal_listing, unmarshal_listing};

use crate::score::Score;

/// Permission bit for setuid, in the packed 32-bit permissions field.
pub const MODE_SETUID: u32 = 1 << 23;

/// Permission bit for setgid.
pub const MODE_SETGID: u32 = 1 << 22;

/// Permission bit for the sticky bit.
pub const MODE_STICKY: u32 = 1 << 20;

/// Mask of the bits a listing entry may carry: rwx for user/group/other
/// plus setuid, setgid, and sticky.
pub const MODE_MASK: u32 = 0o777 | MODE_SETUID | MODE_SETGID | MODE_STICKY;

/// A point in time with nanosecond precision.
///
/// On the wire this is a two-entry integer-keyed map; the same shape is
/// used inside listing entries and the state snapshot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
#[cbor(map)]
pub struct Timespec {
    #[n(0)]
    pub sec: i64,
    #[n(1)]
    pub nsec: u32,
}

/// The contents of a saved regular file: either its chunk scores, in
/// order, or the earlier path this file is a hard link to. Exactly one of
/// the two applies to any entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    /// Scores of the file's chunks, in file order. Empty for an empty file.
    Chunks(Vec<Score>),
    /// Path of the first-seen link to the same inode, relative to the
    /// backup root.
    HardLink(String),
}

/// What kind of node an entry records, with the per-kind payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File(FileData),
    /// Scores of the child listing blob. A well-formed entry has exactly
    /// one; the restorer enforces this.
    Directory { scores: Vec<Score> },
    Symlink { target: String },
    BlockDevice { device: i32 },
    CharDevice { device: i32 },
    NamedPipe,
}

impl EntryKind {
    /// Scores referenced by this entry, if any.
    pub fn scores(&self) -> &[Score] {
        match self {
            EntryKind::File(FileData::Chunks(scores)) => scores,
            EntryKind::Directory { scores } => scores,
            _ => &[],
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, EntryKind::Directory { .. })
    }
}

/// One child of a saved directory.
///
/// The containing device and inode observed at save time drive hard-link
/// detection only; they are deliberately absent here and never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path component. Never empty, never contains `/`.
    pub name: String,
    pub kind: EntryKind,
    /// rwx bits plus setuid/setgid/sticky, packed per the stable layout.
    pub permissions: u32,
    pub uid: u32,
    /// Symbolic owner name, when the uid resolved to one at save time.
    pub username: Option<String>,
    pub gid: u32,
    pub groupname: Option<String>,
    pub mtime: Timespec,
}
