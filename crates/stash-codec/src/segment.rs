use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// Content hash of one segment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentHash([u8; 32]);

impl SegmentHash {
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, used as the last component of the segment key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SegmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentHash({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for SegmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Domain-separated BLAKE3 hasher for segment contents.
///
/// The domain tag is prepended to every computation so that a segment hash
/// can never coincide with a hash computed for some other purpose over the
/// same bytes.
pub struct SegmentHasher {
    domain: &'static str,
}

impl SegmentHasher {
    /// Hasher for value segments.
    pub const SEGMENT: Self = Self {
        domain: "stash-segment-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    pub fn hash(&self, data: &[u8]) -> SegmentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        SegmentHash(*hasher.finalize().as_bytes())
    }

    pub fn verify(&self, data: &[u8], expected: &SegmentHash) -> bool {
        self.hash(data) == *expected
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// One chunk of a serialized value and its hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment<'a> {
    pub hash: SegmentHash,
    pub data: &'a [u8],
}

/// Number of segments needed for `len` bytes: `ceil(len / segment_size)`.
fn segment_count(len: usize, segment_size: usize) -> CodecResult<usize> {
    if segment_size == 0 {
        return Err(CodecError::ZeroSegmentSize);
    }
    Ok(len.div_ceil(segment_size))
}

/// Split `serialized` into ordered segments of at most `segment_size` bytes.
pub fn plan_segments(serialized: &[u8], segment_size: usize) -> CodecResult<Vec<Segment<'_>>> {
    let mut segments = Vec::with_capacity(segment_count(serialized.len(), segment_size)?);
    segments.extend(serialized.chunks(segment_size).map(|data| Segment {
        hash: SegmentHasher::SEGMENT.hash(data),
        data,
    }));
    Ok(segments)
}
