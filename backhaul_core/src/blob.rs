//! The trailing magic byte that types a blob's plaintext.
//!
//! Every blob plaintext ends in one tag byte: `'f'` for a file chunk,
//! `'d'` for a directory listing. The tag is appended when the payload is
//! marshalled and checked and stripped when it is read back, so a listing
//! can never be misread as file data or vice versa.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::store::Result;

/// Tag byte closing a directory-listing blob.
pub const LISTING_TAG: u8 = b'd';

/// Tag byte closing a file-chunk blob.
pub const CHUNK_TAG: u8 = b'f';

/// The two flavors of blob on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    FileChunk,
    Listing,
}

/// Append the file-chunk tag to a chunk payload.
pub fn tag_chunk(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload);
    buf.put_u8(CHUNK_TAG);
    buf.freeze()
}

/// Check and strip the file-chunk tag from a loaded blob.
pub fn strip_chunk_tag(mut blob: Bytes) -> Result<Bytes> {
    match blob.last() {
        Some(&CHUNK_TAG) => {
            blob.truncate(blob.len() - 1);
            Ok(blob)
        }
        Some(&LISTING_TAG) => bail!("blob is a directory listing, not a file chunk"),
        Some(&tag) => bail!("unknown blob tag byte: 0x{tag:02x}"),
        None => bail!("empty blob has no tag byte"),
    }
}

/// Append the directory-listing tag to a marshalled listing.
pub(crate) fn tag_listing(payload: Vec<u8>) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(&payload);
    buf.put_u8(LISTING_TAG);
    buf.freeze()
}

/// Check and strip the directory-listing tag from a loaded blob.
pub(crate) fn strip_listing_tag(blob: &[u8]) -> Result<&[u8]> {
    match blob.last() {
        Some(&LISTING_TAG) => Ok(&blob[..blob.len() - 1]),
        Some(&CHUNK_TAG) => bail!("blob is a file chunk, not a directory listing"),
        Some(&tag) => bail!("unknown blob tag byte: 0x{tag:02x}"),
        None => bail!("empty blob has no tag byte"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tag_round_trip() {
        let tagged = tag_chunk(b"burrito");
        assert_eq!(tagged.last(), Some(&CHUNK_TAG));
        let stripped = strip_chunk_tag(tagged).unwrap();
        assert_eq!(&stripped[..], b"burrito");
    }

    #[test]
    fn empty_chunk_still_carries_tag() {
        let tagged = tag_chunk(b"");
        assert_eq!(&tagged[..], b"f");
        assert_eq!(&strip_chunk_tag(tagged).unwrap()[..], b"");
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let listing = tag_listing(vec![1, 2, 3]);
        assert!(strip_chunk_tag(listing).is_err());
        assert!(strip_listing_tag(&tag_chunk(b"x")).is_err());
        assert!(strip_listing_tag(b"").is_err());
        assert!(strip_chunk_tag(Bytes::from_static(b"abc\x00")).is_err());
    }
}
