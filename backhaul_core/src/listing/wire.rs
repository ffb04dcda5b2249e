//! The listing wire format.
//!
//! A listing blob is an integer-keyed CBOR map (field numbers below are
//! wire-stable) followed by the directory tag byte. Decoding skips unknown
//! field numbers, so old readers tolerate new fields. Entry order is
//! preserved exactly.
//!
//! Field numbers: type=1, permissions=2, uid=3, username=4, gid=5,
//! groupname=6, name=7, mtime=8, scores=9, hard_link_target=10, target=11,
//! device_number=12.

use anyhow::{Context, bail};
use bytes::Bytes;
use minicbor::{Decode, Encode};

use crate::blob::{strip_listing_tag, tag_listing};
use crate::score::Score;
use crate::store::Result;

use super::{Entry, EntryKind, FileData, Timespec};

const TYPE_FILE: i32 = 0;
const TYPE_DIRECTORY: i32 = 1;
const TYPE_SYMLINK: i32 = 2;
const TYPE_BLOCK_DEVICE: i32 = 3;
const TYPE_CHAR_DEVICE: i32 = 4;
const TYPE_NAMED_PIPE: i32 = 5;

#[derive(Encode, Decode, Clone, Debug)]
#[cbor(map)]
struct WireEntry {
    #[n(1)]
    kind: i32,
    #[n(2)]
    permissions: u32,
    #[n(3)]
    uid: u32,
    #[n(4)]
    username: Option<String>,
    #[n(5)]
    gid: u32,
    #[n(6)]
    groupname: Option<String>,
    #[n(7)]
    name: String,
    #[n(8)]
    mtime: Timespec,
    #[n(9)]
    scores: Option<Vec<Score>>,
    #[n(10)]
    hard_link_target: Option<String>,
    #[n(11)]
    target: Option<String>,
    #[n(12)]
    device_number: Option<i32>,
}

#[derive(Encode, Decode, Clone, Debug)]
#[cbor(map)]
struct WireListing {
    #[n(1)]
    entries: Vec<WireEntry>,
}

fn to_wire(entry: &Entry) -> WireEntry {
    let mut wire = WireEntry {
        kind: 0,
        permissions: entry.permissions,
        uid: entry.uid,
        username: entry.username.clone(),
        gid: entry.gid,
        groupname: entry.groupname.clone(),
        name: entry.name.clone(),
        mtime: entry.mtime,
        scores: None,
        hard_link_target: None,
        target: None,
        device_number: None,
    };

    match &entry.kind {
        EntryKind::File(FileData::Chunks(scores)) => {
            wire.kind = TYPE_FILE;
            if !scores.is_empty() {
                wire.scores = Some(scores.clone());
            }
        }
        EntryKind::File(FileData::HardLink(target)) => {
            wire.kind = TYPE_FILE;
            wire.hard_link_target = Some(target.clone());
        }
        EntryKind::Directory { scores } => {
            wire.kind = TYPE_DIRECTORY;
            wire.scores = Some(scores.clone());
        }
        EntryKind::Symlink { target } => {
            wire.kind = TYPE_SYMLINK;
            wire.target = Some(target.clone());
        }
        EntryKind::BlockDevice { device } => {
            wire.kind = TYPE_BLOCK_DEVICE;
            wire.device_number = Some(*device);
        }
        EntryKind::CharDevice { device } => {
            wire.kind = TYPE_CHAR_DEVICE;
            wire.device_number = Some(*device);
        }
        EntryKind::NamedPipe => {
            wire.kind = TYPE_NAMED_PIPE;
        }
    }

    wire
}

fn from_wire(wire: WireEntry) -> Result<Entry> {
    if wire.name.is_empty() {
        bail!("entry has an empty name");
    }
    if wire.name.contains('/') {
        bail!("entry name {:?} contains a path separator", wire.name);
    }

    let scores = wire.scores.unwrap_or_default();

    let kind = match wire.kind {
        TYPE_FILE => {
            if wire.target.is_some() {
                bail!("file entry {:?} carries a symlink target", wire.name);
            }
            match wire.hard_link_target {
                Some(target) => {
                    if !scores.is_empty() {
                        bail!(
                            "file entry {:?} has both scores and a hard link target",
                            wire.name
                        );
                    }
                    EntryKind::File(FileData::HardLink(target))
                }
                None => EntryKind::File(FileData::Chunks(scores)),
            }
        }
        TYPE_DIRECTORY => {
            if wire.hard_link_target.is_some() || wire.target.is_some() {
                bail!("directory entry {:?} carries link fields", wire.name);
            }
            EntryKind::Directory { scores }
        }
        TYPE_SYMLINK => {
            if !scores.is_empty() {
                bail!("symlink entry {:?} must not carry scores", wire.name);
            }
            let target = wire
                .target
                .with_context(|| format!("symlink entry {:?} has no target", wire.name))?;
            EntryKind::Symlink { target }
        }
        TYPE_BLOCK_DEVICE | TYPE_CHAR_DEVICE => {
            if !scores.is_empty() {
                bail!("device entry {:?} must not carry scores", wire.name);
            }
            let device = wire
                .device_number
                .with_context(|| format!("device entry {:?} has no device number", wire.name))?;
            if wire.kind == TYPE_BLOCK_DEVICE {
                EntryKind::BlockDevice { device }
            } else {
                EntryKind::CharDevice { device }
            }
        }
        TYPE_NAMED_PIPE => {
            if !scores.is_empty() {
                bail!("named pipe entry {:?} must not carry scores", wire.name);
            }
            EntryKind::NamedPipe
        }
        v => bail!("unhandled entry type: {v}"),
    };

    Ok(Entry {
        name: wire.name,
        kind,
        permissions: wire.permissions,
        uid: wire.uid,
        username: wire.username,
        gid: wire.gid,
        groupname: wire.groupname,
        mtime: wire.mtime,
    })
}

/// Serialize a directory listing into a tagged blob plaintext.
pub fn marshal_listing(entries: &[Entry]) -> Result<Bytes> {
    let wire = WireListing {
        entries: entries.iter().map(to_wire).collect(),
    };
    let encoded = minicbor::to_vec(&wire).map_err(|e| anyhow::anyhow!("encoding listing: {e}"))?;
    Ok(tag_listing(encoded))
}

/// Parse a tagged listing blob back into its entries.
pub fn unmarshal_listing(blob: &[u8]) -> Result<Vec<Entry>> {
    let payload = strip_listing_tag(blob)?;
    let wire: WireListing =
        minicbor::decode(payload).map_err(|e| anyhow::anyhow!("decoding listing: {e}"))?;
    wire.entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| from_wire(entry).with_context(|| format!("listing entry {i}")))
        .collect()
}
