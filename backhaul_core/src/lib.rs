//! Core Backhaul types and traits.
//!
//! This crate defines the shared vocabulary used by all Backhaul crates.
//!
//! ## Wire-stable types
//!
//! The following modules define on-disk / on-the-wire formats that must not
//! change shape between releases:
//!
//! - Content scores (`score::Score`): the 20-byte hash a blob is stored
//!   under, computed over its ciphertext.
//! - Blob tagging (`blob`): the trailing magic byte that distinguishes
//!   directory-listing blobs from file-chunk blobs.
//! - Directory listings (`listing`): the serialized contents of one saved
//!   directory.
//! - Wire timestamps (`timefmt`): ISO-8601 UTC at second precision, used
//!   by the completed-job log.
//!
//! ## Seams
//!
//! Backends plug in through three narrow traits:
//!
//! - [`BlobStore`]: score-addressed blob storage, implemented by the
//!   layered stack in `backhaul_blobs`.
//! - [`ObjectStore`]: the raw name to bytes object store underneath it
//!   (`blob_stores/*`).
//! - [`RecordStore`]: attribute records with conditional writes, backing
//!   the registry (`registries/*`).
//!
//! Encryption is consumed through the [`Crypter`] trait so that the blob
//! layers and the registry never depend on a concrete cipher.

pub mod blob;
pub mod crypto;
pub mod error;
pub mod listing;
pub mod records;
pub mod score;
pub mod store;
pub mod timefmt;

// --- Core Public Surface ---

pub use blob::{BlobKind, strip_chunk_tag, tag_chunk};
pub use crypto::Crypter;
pub use error::{
    Cancelled, IncompatibleCredential, NotAuthentic, NotFound, PreconditionFailed, Transient,
    is_kind,
};
pub use listing::{Entry, EntryKind, FileData, Timespec, marshal_listing, unmarshal_listing};
pub use records::{Precondition, Record, RecordStore};
pub use score::Score;
pub use store::{BlobStore, ObjectStore, Result};
