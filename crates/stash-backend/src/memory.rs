//! In-memory backend for tests and single-process embedding.
//!
//! [`InMemoryBackend`] keeps every entry in a `HashMap` behind a `RwLock` and
//! implements every primitive of [`CacheBackend`], including native CAS and
//! increment. Both can be switched off to exercise the client's emulated
//! paths, and the whole backend can be made "unreachable" to exercise I/O
//! failure handling.
//!
//! Expired entries are invisible to reads and are dropped from the map by a
//! sweep that runs every [`PURGE_INTERVAL`] inserts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use stash_types::{CasToken, Flags, Ttl};
use tracing::trace;

use crate::error::{BackendError, BackendResult};
use crate::traits::CacheBackend;

/// Inserts between sweeps of expired entries.
pub const PURGE_INTERVAL: u64 = 64;

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    version: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// An in-memory implementation of [`CacheBackend`].
///
/// Data is lost when the backend is dropped. Share it between clients with
/// an `Arc` to model several processes talking to one cache cluster.
#[derive(Debug)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    next_version: AtomicU64,
    inserts: AtomicU64,
    native_cas: bool,
    native_incr: bool,
    unreachable: AtomicBool,
    rejected_prefix: RwLock<Option<String>>,
}

impl InMemoryBackend {
    /// A backend with native CAS and increment.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            inserts: AtomicU64::new(0),
            native_cas: true,
            native_incr: true,
            unreachable: AtomicBool::new(false),
            rejected_prefix: RwLock::new(None),
        }
    }

    /// A backend that reports CAS as unsupported.
    pub fn without_native_cas() -> Self {
        Self {
            native_cas: false,
            ..Self::new()
        }
    }

    /// A backend that reports increment as unsupported.
    pub fn without_native_incr() -> Self {
        Self {
            native_incr: false,
            ..Self::new()
        }
    }

    /// Make every primitive fail with [`BackendError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Decline (return `Ok(false)`) every write to keys starting with
    /// `prefix`. `None` accepts all writes again.
    pub fn reject_writes_with_prefix(&self, prefix: Option<&str>) {
        let mut rejected = self
            .rejected_prefix
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *rejected = prefix.map(str::to_string);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read_map()
            .map(|map| map.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted list of live keys.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .read_map()
            .map(|map| {
                map.iter()
                    .filter(|(_, e)| e.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// Raw stored bytes for `key`, bypassing fault injection.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.read_map()
            .ok()?
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn stored_len(&self) -> usize {
        self.read_map().map(|map| map.len()).unwrap_or(0)
    }

    /// Remove `key` directly, bypassing fault injection.
    pub fn remove_raw(&self, key: &str) -> bool {
        self.write_map()
            .map(|mut map| map.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        if let Ok(mut map) = self.write_map() {
            map.clear();
        }
    }

    fn read_map(&self) -> BackendResult<RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|e| BackendError::Poisoned(e.to_string()))
    }

    fn write_map(&self) -> BackendResult<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|e| BackendError::Poisoned(e.to_string()))
    }

    fn check_reachable(&self) -> BackendResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("in-memory backend marked down".into()));
        }
        Ok(())
    }

    fn write_rejected(&self, key: &str) -> bool {
        let rejected = self
            .rejected_prefix
            .read()
            .unwrap_or_else(|e| e.into_inner());
        rejected.as_deref().is_some_and(|prefix| key.starts_with(prefix))
    }

    fn new_entry(&self, value: &[u8], ttl: Ttl, now: Instant) -> Entry {
        Entry {
            value: value.to_vec(),
            expires_at: ttl.deadline(now),
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Insert under an already held write guard, sweeping expired entries
    /// every `PURGE_INTERVAL` inserts.
    fn insert_entry(&self, map: &mut HashMap<String, Entry>, key: &str, entry: Entry, now: Instant) {
        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % PURGE_INTERVAL == 0 {
            let before = map.len();
            map.retain(|_, e| e.is_live(now));
            let purged = before - map.len();
            if purged > 0 {
                trace!(purged, remaining = map.len(), "purged expired entries");
            }
        }
        map.insert(key.to_string(), entry);
    }

    fn version_token(version: u64) -> CasToken {
        CasToken::from_native(version.to_be_bytes())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    fn do_get(&self, key: &str, _flags: Flags) -> BackendResult<Option<Vec<u8>>> {
        self.check_reachable()?;
        let now = Instant::now();
        let map = self.read_map()?;
        Ok(map.get(key).filter(|e| e.is_live(now)).map(|e| e.value.clone()))
    }

    fn do_set(&self, key: &str, value: &[u8], ttl: Ttl, flags: Flags) -> BackendResult<bool> {
        self.check_reachable()?;
        if self.write_rejected(key) {
            trace!(key, "write rejected by fault injection");
            return Ok(false);
        }
        let now = Instant::now();
        let entry = self.new_entry(value, ttl, now);
        let mut map = self.write_map()?;
        self.insert_entry(&mut map, key, entry, now);
        trace!(key, len = value.len(), ?flags, "set");
        Ok(true)
    }

    fn do_delete(&self, key: &str, _flags: Flags) -> BackendResult<bool> {
        self.check_reachable()?;
        let mut map = self.write_map()?;
        map.remove(key);
        Ok(true)
    }

    fn add(&self, key: &str, value: &[u8], ttl: Ttl, _flags: Flags) -> BackendResult<bool> {
        self.check_reachable()?;
        if self.write_rejected(key) {
            return Ok(false);
        }
        let now = Instant::now();
        let mut map = self.write_map()?;
        if map.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        let entry = self.new_entry(value, ttl, now);
        self.insert_entry(&mut map, key, entry, now);
        Ok(true)
    }

    fn incr(&self, key: &str, delta: i64) -> BackendResult<Option<i64>> {
        if !self.native_incr {
            return Err(BackendError::Unsupported("incr"));
        }
        self.check_reachable()?;
        let now = Instant::now();
        let mut map = self.write_map()?;
        let Some(entry) = map.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(None);
        };
        let Some(current) = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        else {
            return Ok(None);
        };
        // Clamp at zero like memcached's decr.
        let next = current.saturating_add(delta).max(0);
        entry.value = next.to_string().into_bytes();
        entry.version = self.next_version.fetch_add(1, Ordering::Relaxed);
        Ok(Some(next))
    }

    fn do_get_with_token(
        &self,
        key: &str,
        _flags: Flags,
    ) -> BackendResult<Option<(Vec<u8>, CasToken)>> {
        self.check_reachable()?;
        let now = Instant::now();
        let map = self.read_map()?;
        Ok(map.get(key).filter(|e| e.is_live(now)).map(|e| {
            let token = if self.native_cas {
                Self::version_token(e.version)
            } else {
                CasToken::of(&e.value)
            };
            (e.value.clone(), token)
        }))
    }

    fn do_cas(
        &self,
        key: &str,
        token: &CasToken,
        value: &[u8],
        ttl: Ttl,
        _flags: Flags,
    ) -> BackendResult<bool> {
        if !self.native_cas {
            return Err(BackendError::Unsupported("cas"));
        }
        self.check_reachable()?;
        if self.write_rejected(key) {
            return Ok(false);
        }
        let now = Instant::now();
        let mut map = self.write_map()?;
        let matches = map
            .get(key)
            .filter(|e| e.is_live(now))
            .is_some_and(|e| Self::version_token(e.version) == *token);
        if !matches {
            return Ok(false);
        }
        let entry = self.new_entry(value, ttl, now);
        self.insert_entry(&mut map, key, entry, now);
        Ok(true)
    }
}
