//! Value codec for Stash.
//!
//! Backends only ever see bytes. This crate decides what those bytes look
//! like:
//!
//! - [`Value::Int`](stash_types::Value::Int) is written as ASCII decimal, so
//!   a memcached-style `incr` can operate on it in place.
//! - Everything else is a bincode-encoded [`Container`]: a raw value, a
//!   *unified* container holding the value bytes inline, or a *segmented*
//!   container listing the hashes of the chunks the value bytes were split
//!   into.
//!
//! The first byte of an encoded container is a bincode variant tag, which
//! is never an ASCII digit or `-`, so the two forms cannot be confused.
//!
//! # Modules
//!
//! - [`codec`] -- Encoding and classification of stored bytes
//! - [`segment`] -- Chunk hashing and splitting for large values

pub mod codec;
pub mod error;
pub mod segment;

pub use codec::{decode_stored, encode_container, encode_int, encode_value, Container, Stored};
pub use error::{CodecError, CodecResult};
pub use segment::{plan_segments, Segment, SegmentHash, SegmentHasher};
