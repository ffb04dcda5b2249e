//! The score type used by Backhaul (SHA-1 over ciphertext, 20 bytes).

use std::{borrow::Borrow, fmt, str::FromStr};

use minicbor::{Decode, Decoder, Encode, Encoder, decode, encode};
use sha1::{Digest, Sha1};

/// Number of bytes in a [`Score`].
pub const SCORE_LEN: usize = 20;

/// Hex characters in the canonical string form of a [`Score`].
pub const SCORE_HEX_LEN: usize = 2 * SCORE_LEN;

/// The identity of one stored blob: the SHA-1 digest of its ciphertext.
///
/// Scores are plain value types. They are compared byte-wise, hash cheaply,
/// and render as exactly 40 lower-case hex characters.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct Score([u8; SCORE_LEN]);

impl fmt::Debug for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Score({})", self.to_hex())
    }
}

impl Score {
    /// The score of the empty byte string.
    pub const EMPTY: Score = Score([
        0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60, 0x18,
        0x90, 0xaf, 0xd8, 0x07, 0x09,
    ]);

    /// Compute the score of the provided bytes.
    pub fn compute(buf: impl AsRef<[u8]>) -> Self {
        let digest = Sha1::digest(buf.as_ref());
        Score(digest.into())
    }

    /// Bytes of the score.
    pub fn as_bytes(&self) -> &[u8; SCORE_LEN] {
        &self.0
    }

    /// Create a `Score` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; SCORE_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a `Score` from a slice, which must be exactly 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidScore> {
        let arr: [u8; SCORE_LEN] = bytes
            .try_into()
            .map_err(|_| InvalidScore(format!("expected {SCORE_LEN} bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Canonical lower-case hex form, used for object names and logging.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes in hex, for log lines that name many scores.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Error returned when bytes or hex do not form a valid score.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid score: {0}")]
pub struct InvalidScore(String);

impl FromStr for Score {
    type Err = InvalidScore;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SCORE_HEX_LEN {
            return Err(InvalidScore(format!(
                "expected {SCORE_HEX_LEN} hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| InvalidScore(e.to_string()))?;
        Score::from_slice(&bytes)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Score {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Score {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; SCORE_LEN]> for Score {
    fn from(value: [u8; SCORE_LEN]) -> Self {
        Score(value)
    }
}

impl From<Score> for [u8; SCORE_LEN] {
    fn from(value: Score) -> Self {
        value.0
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// Scores travel inside listing blobs and the state snapshot as CBOR byte
// strings of exactly 20 bytes; any other length is rejected on read.

impl<C> Encode<C> for Score {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        e.bytes(&self.0)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Score {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut C) -> Result<Self, decode::Error> {
        let bytes = d.bytes()?;
        Score::from_slice(bytes).map_err(|_| decode::Error::message("score must be 20 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_score_matches_sha1_of_nothing() {
        assert_eq!(Score::compute(b""), Score::EMPTY);
        assert_eq!(
            Score::EMPTY.to_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn compute_is_deterministic() {
        let a = Score::compute(b"burrito");
        let b = Score::compute(b"burrito");
        assert_eq!(a, b);
        assert_ne!(a, Score::compute(b"enchilada"));
    }

    #[test]
    fn hex_round_trip() {
        let score = Score::compute(b"taco");
        let hex = score.to_hex();
        assert_eq!(hex.len(), SCORE_HEX_LEN);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(hex.parse::<Score>().unwrap(), score);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("da39".parse::<Score>().is_err());
        assert!(
            "zz39a3ee5e6b4b0d3255bfef95601890afd80709"
                .parse::<Score>()
                .is_err()
        );
    }

    #[test]
    fn cbor_round_trip() {
        let score = Score::compute(b"queso");
        let encoded = minicbor::to_vec(score).unwrap();
        let decoded: Score = minicbor::decode(&encoded).unwrap();
        assert_eq!(decoded, score);
    }

    #[test]
    fn cbor_rejects_wrong_length() {
        let encoded = minicbor::to_vec(minicbor::bytes::ByteVec::from(vec![1, 2, 3])).unwrap();
        assert!(minicbor::decode::<Score>(&encoded).is_err());
    }
}
