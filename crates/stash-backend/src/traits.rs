use std::collections::HashMap;

use stash_types::{CasToken, Flags, Ttl};

use crate::error::{BackendError, BackendResult};

/// Primitive key/value operations a concrete store must provide.
///
/// All implementations must satisfy these invariants:
/// - `do_get` honors `READ_LATEST` by bypassing any staleness-tolerant
///   replica. `READ_VERIFIED` is informational.
/// - `do_set` with `WRITE_SYNC` returns only once the write is visible across
///   the whole access scope.
/// - `add` is atomic: of several concurrent `add` calls for an absent key,
///   exactly one succeeds.
/// - Values are opaque bytes. The backend never interprets them, except that
///   `incr` operates on ASCII decimal integers.
pub trait CacheBackend: Send + Sync {
    /// Fetch a value. Returns `Ok(None)` if the key is absent or expired.
    fn do_get(&self, key: &str, flags: Flags) -> BackendResult<Option<Vec<u8>>>;

    /// Store a value unconditionally. Returns `Ok(false)` if the store
    /// declined the write (for example, the value is too large for it).
    fn do_set(&self, key: &str, value: &[u8], ttl: Ttl, flags: Flags) -> BackendResult<bool>;

    /// Delete a key. Returns `Ok(true)` if the key is gone afterwards,
    /// including when it never existed.
    fn do_delete(&self, key: &str, flags: Flags) -> BackendResult<bool>;

    /// Store a value only if the key does not exist yet.
    fn add(&self, key: &str, value: &[u8], ttl: Ttl, flags: Flags) -> BackendResult<bool>;

    /// Atomically add `delta` to an integer value, preserving its expiry.
    ///
    /// Returns `Ok(None)` if the key is absent or not an integer. Backends
    /// without a native increment keep this default, and the client falls
    /// back to a lock-protected read-modify-write.
    fn incr(&self, key: &str, delta: i64) -> BackendResult<Option<i64>> {
        let _ = (key, delta);
        Err(BackendError::Unsupported("incr"))
    }

    /// Fetch a value together with a CAS token for a later [`Self::do_cas`].
    ///
    /// The default token is a digest of the stored bytes, which is what the
    /// client's lock-based CAS emulation compares.
    fn do_get_with_token(
        &self,
        key: &str,
        flags: Flags,
    ) -> BackendResult<Option<(Vec<u8>, CasToken)>> {
        Ok(self.do_get(key, flags)?.map(|value| {
            let token = CasToken::of(&value);
            (value, token)
        }))
    }

    /// Native compare-and-swap: store `value` only if the key still matches
    /// `token`. Returns `Ok(false)` on a token mismatch.
    ///
    /// Backends without native CAS keep this default, and the client emulates
    /// CAS with an advisory lock.
    fn do_cas(
        &self,
        key: &str,
        token: &CasToken,
        value: &[u8],
        ttl: Ttl,
        flags: Flags,
    ) -> BackendResult<bool> {
        let _ = (key, token, value, ttl, flags);
        Err(BackendError::Unsupported("cas"))
    }

    /// Fetch several keys. Absent keys are missing from the result map.
    ///
    /// Default implementation calls `do_get()` for each key. Backends may
    /// override for fewer round-trips.
    fn do_get_multi(&self, keys: &[String], flags: Flags) -> BackendResult<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.do_get(key, flags)? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// Store several values with one TTL. Returns `Ok(true)` only if every
    /// write succeeded. Writes are not rolled back on partial failure.
    fn do_set_multi(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Ttl,
        flags: Flags,
    ) -> BackendResult<bool> {
        let mut all_ok = true;
        for (key, value) in entries {
            all_ok &= self.do_set(key, value, ttl, flags)?;
        }
        Ok(all_ok)
    }

    /// Delete several keys. Returns `Ok(true)` only if every delete succeeded.
    fn do_delete_multi(&self, keys: &[String], flags: Flags) -> BackendResult<bool> {
        let mut all_ok = true;
        for key in keys {
            all_ok &= self.do_delete(key, flags)?;
        }
        Ok(all_ok)
    }
}
