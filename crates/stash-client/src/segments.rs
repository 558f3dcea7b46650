//! Value segmentation.
//!
//! A segmentation-enabled write of a byte value larger than
//! `segmentation_size` splits the bytes into chunks, stores each chunk under
//! a global key derived from its content hash, and stores only the ordered
//! list of hashes under the main key. All chunks are written before the main
//! key, so a reader that finds the main key can expect its chunks, and a
//! missing chunk is treated as a miss for the whole value.
//!
//! Chunks are never deleted on overwrite. They are left to expire or are
//! removed by a delete with `WRITE_PRUNE_SEGMENTS`.

use stash_codec::{
    decode_stored, encode_container, encode_value, plan_segments, Container, SegmentHash,
    SegmentHasher, Stored,
};
use stash_types::{Flags, Ttl, Value};
use tracing::{debug, warn};

use crate::client::StashClient;
use crate::error::CacheError;

const SEGMENT_COLLECTION: &str = "segment";

impl StashClient {
    /// Backend key of one chunk of the value stored under `key`.
    pub(crate) fn segment_key(&self, key: &str, hash: &SegmentHash) -> String {
        self.config
            .keyspace
            .make_global_key(SEGMENT_COLLECTION, [key, hash.to_hex().as_str()])
    }

    /// Produce the bytes to store under the main key, writing chunks first
    /// if the value has to be segmented. `None` means nothing may be written.
    pub(crate) fn make_value_or_segments(
        &self,
        key: &str,
        value: &Value,
        ttl: Ttl,
        flags: Flags,
    ) -> Option<Vec<u8>> {
        let bytes = match value {
            Value::Bytes(bytes) if flags.contains(Flags::WRITE_ALLOW_SEGMENTS) => bytes,
            _ => return self.codec(key, encode_value(value)),
        };

        let size = self.config.segmentation_size;
        if bytes.len() <= size {
            return self.codec(key, encode_container(&Container::Unified(bytes.clone())));
        }

        let max = self.config.segmented_value_max_size;
        if bytes.len() > max {
            warn!(key, size = bytes.len(), max, "value too large to segment");
            self.record(CacheError::ValueTooLarge {
                key: key.to_string(),
                size: bytes.len(),
                max,
            });
            return None;
        }

        let segments = self.codec(key, plan_segments(bytes, size))?;
        let chunks: Vec<(String, Vec<u8>)> = segments
            .iter()
            .map(|s| (self.segment_key(key, &s.hash), s.data.to_vec()))
            .collect();
        let chunk_flags = flags.without(Flags::WRITE_ALLOW_SEGMENTS);
        if !self.set_encoded_multi(&chunks, ttl, chunk_flags) {
            warn!(key, segments = chunks.len(), "could not store all segments");
            return None;
        }
        debug!(key, segments = chunks.len(), "stored segments");

        let hashes = segments.into_iter().map(|s| s.hash).collect();
        self.codec(key, encode_container(&Container::Segmented(hashes)))
    }

    /// Turn the bytes stored under a main key back into a value, fetching
    /// chunks when they are segmented. `None` on any missing chunk.
    pub(crate) fn resolve_segments(&self, key: &str, raw: &[u8], flags: Flags) -> Option<Value> {
        let hashes = match self.codec(key, decode_stored(raw))? {
            Stored::Int(n) => return Some(Value::Int(n)),
            Stored::Container(Container::Raw(bytes) | Container::Unified(bytes)) => {
                return Some(Value::Bytes(bytes))
            }
            Stored::Container(Container::Segmented(hashes)) => hashes,
        };

        let keys: Vec<String> = hashes.iter().map(|h| self.segment_key(key, h)).collect();
        let found = self.io(self.backend.do_get_multi(&keys, flags))?;

        let mut out = Vec::new();
        for (chunk_key, hash) in keys.iter().zip(&hashes) {
            let Some(chunk) = found.get(chunk_key) else {
                debug!(key, segment = %hash, "missing segment");
                return None;
            };
            if !SegmentHasher::SEGMENT.verify(chunk, hash) {
                warn!(key, segment = %hash, "segment content does not match its hash");
                return None;
            }
            out.extend_from_slice(chunk);
        }
        Some(Value::Bytes(out))
    }

    /// Rewrite the chunks of a segmented value with `ttl` so they do not
    /// expire before the main key. Values that are not segmented have
    /// nothing to refresh. `false` if a chunk is missing or a rewrite fails.
    pub(crate) fn refresh_segment_ttls(&self, key: &str, raw: &[u8], ttl: Ttl, flags: Flags) -> bool {
        let container = match decode_stored(raw) {
            Ok(Stored::Container(c)) if c.is_segmented() => c,
            _ => return true,
        };
        let keys: Vec<String> = container
            .segment_hashes()
            .iter()
            .map(|h| self.segment_key(key, h))
            .collect();
        let Some(mut found) = self.io(self.backend.do_get_multi(&keys, Flags::READ_LATEST)) else {
            return false;
        };

        let mut chunks = Vec::with_capacity(keys.len());
        for chunk_key in keys {
            let Some(data) = found.remove(&chunk_key) else {
                debug!(key, segment = %chunk_key, "missing segment, TTL left unchanged");
                return false;
            };
            chunks.push((chunk_key, data));
        }
        let chunk_flags = flags.without(Flags::WRITE_ALLOW_SEGMENTS | Flags::WRITE_PRUNE_SEGMENTS);
        self.set_encoded_multi(&chunks, ttl, chunk_flags)
    }

    /// Delete a key. With `WRITE_PRUNE_SEGMENTS`, also delete the chunks of
    /// a segmented value stored under it.
    pub fn delete(&self, key: &str, flags: Flags) -> bool {
        if !flags.contains(Flags::WRITE_PRUNE_SEGMENTS) {
            return self
                .io(self.backend.do_delete(key, flags))
                .unwrap_or(false);
        }

        let chunk_keys: Vec<String> = self
            .io(self.backend.do_get(key, Flags::READ_LATEST))
            .flatten()
            .and_then(|raw| decode_stored(&raw).ok())
            .map(|stored| match stored {
                Stored::Container(c) if c.is_segmented() => c
                    .segment_hashes()
                    .iter()
                    .map(|h| self.segment_key(key, h))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        let flags = flags.without(Flags::WRITE_PRUNE_SEGMENTS);
        let mut ok = self
            .io(self.backend.do_delete(key, flags))
            .unwrap_or(false);
        if ok && !chunk_keys.is_empty() {
            ok = self
                .io(self.backend.do_delete_multi(&chunk_keys, flags))
                .unwrap_or(false);
            debug!(key, segments = chunk_keys.len(), ok, "pruned segments");
        }
        ok
    }
}
