use serde::{Deserialize, Serialize};
use stash_types::Value;

use crate::error::{CodecError, CodecResult};
use crate::segment::SegmentHash;

/// Longest decimal form of an `i64` ("-9223372036854775808").
const MAX_INT_LEN: usize = 20;

/// The shape of a non-integer value stored under a main key.
///
/// Exactly one of these is ever stored under a main key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    /// A plain byte value written without segmentation enabled.
    Raw(Vec<u8>),
    /// Value bytes stored inline by a segmentation-enabled write.
    Unified(Vec<u8>),
    /// Ordered hashes of the chunks the value bytes were split into.
    Segmented(Vec<SegmentHash>),
}

impl Container {
    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Segmented(_))
    }

    /// Segment hashes, empty unless segmented.
    pub fn segment_hashes(&self) -> &[SegmentHash] {
        match self {
            Self::Segmented(hashes) => hashes,
            _ => &[],
        }
    }
}

/// A stored blob, classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stored {
    Int(i64),
    Container(Container),
}

fn parse_int(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > MAX_INT_LEN {
        return None;
    }
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub fn encode_int(n: i64) -> Vec<u8> {
    n.to_string().into_bytes()
}

pub fn encode_container(container: &Container) -> CodecResult<Vec<u8>> {
    bincode::serialize(container).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Classify stored bytes as a native integer or a container.
pub fn decode_stored(bytes: &[u8]) -> CodecResult<Stored> {
    if let Some(n) = parse_int(bytes) {
        return Ok(Stored::Int(n));
    }
    bincode::deserialize(bytes)
        .map(Stored::Container)
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode a value for a plain (non-segmenting) write.
pub fn encode_value(value: &Value) -> CodecResult<Vec<u8>> {
    match value {
        Value::Int(n) => Ok(encode_int(*n)),
        Value::Bytes(bytes) => encode_container(&Container::Raw(bytes.clone())),
    }
}
