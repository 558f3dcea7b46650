use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stash_backend::{BackendError, BackendResult, CacheBackend};
use stash_codec::{decode_stored, encode_int, encode_value, CodecResult, Stored};
use stash_types::{Flags, Keyspace, Ttl, Value};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::deferred::{DeferredRunner, ImmediateRunner};
use crate::diagnostics::DupeTracker;
use crate::error::{CacheError, CacheErrorKind, CacheResult, ErrorState};
use crate::lock::{LockRegistry, DEFAULT_LOCK_EXPIRY};

/// How long the emulated `incr` waits for the key's lock.
const INCR_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// StashClient
// ---------------------------------------------------------------------------

/// Cache client layered over a [`CacheBackend`].
///
/// One client serves one logical caller. Many clients, in this process or
/// others, may share the same backend; everything that needs mutual
/// exclusion between them goes through the backend's `add` and CAS
/// primitives.
///
/// Expected failures return `None`/`false`. When the cause is an actual
/// failure rather than a miss or a lost race, it is also recorded in the
/// last-error register (see [`Self::last_error`]).
pub struct StashClient {
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) config: CacheConfig,
    pub(crate) runner: Arc<dyn DeferredRunner>,
    pub(crate) errors: ErrorState,
    pub(crate) locks: LockRegistry,
    pub(crate) dupes: DupeTracker,
}

/// Builder for [`StashClient`].
pub struct StashClientBuilder {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    runner: Option<Arc<dyn DeferredRunner>>,
}

impl StashClientBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Runner for deferred diagnostics. Defaults to [`ImmediateRunner`].
    pub fn runner(mut self, runner: Arc<dyn DeferredRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> CacheResult<StashClient> {
        self.config.validate()?;
        Ok(StashClient {
            dupes: DupeTracker::new(self.config.report_dupes),
            backend: self.backend,
            config: self.config,
            runner: self
                .runner
                .unwrap_or_else(|| Arc::new(ImmediateRunner) as Arc<dyn DeferredRunner>),
            errors: ErrorState::new(),
            locks: LockRegistry::new(),
        })
    }
}

impl StashClient {
    pub fn builder(backend: Arc<dyn CacheBackend>) -> StashClientBuilder {
        StashClientBuilder {
            backend,
            config: CacheConfig::default(),
            runner: None,
        }
    }

    /// Client with the given configuration and an inline deferred runner.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> CacheResult<Self> {
        Self::builder(backend).config(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.config.keyspace
    }

    // ---- Keys ----

    /// Make a key scoped to this client's keyspace.
    pub fn make_key<'a, I>(&self, components: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.config.keyspace.make_key(components)
    }

    /// Make a key shared by every client of the backend.
    pub fn make_global_key<'a, I>(&self, collection: &'a str, components: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.config.keyspace.make_global_key(collection, components)
    }

    // ---- Error register ----

    pub fn last_error(&self) -> Option<CacheError> {
        self.errors.last()
    }

    pub fn last_error_kind(&self) -> CacheErrorKind {
        self.errors.kind()
    }

    pub fn clear_last_error(&self) {
        self.errors.clear();
    }

    pub(crate) fn record(&self, error: impl Into<CacheError>) {
        self.errors.record(error.into());
    }

    /// Unwrap a backend result, recording the failure.
    pub(crate) fn io<T>(&self, result: BackendResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "backend operation failed");
                self.record(e);
                None
            }
        }
    }

    /// Unwrap a codec result, recording the failure.
    pub(crate) fn codec<T>(&self, key: &str, result: CodecResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "could not encode or decode cached value");
                self.record(e);
                None
            }
        }
    }

    // ---- Reads ----

    /// Fetch a value. `None` means a miss or a failure; check
    /// [`Self::last_error`] to tell them apart.
    pub fn get(&self, key: &str, flags: Flags) -> Option<Value> {
        self.dupes.track(key, self.runner.as_ref());
        let raw = self.io(self.backend.do_get(key, flags))??;
        self.resolve_segments(key, &raw, flags)
    }

    /// Fetch several values. Missing keys are absent from the result.
    pub fn get_multi(&self, keys: &[String], flags: Flags) -> HashMap<String, Value> {
        for key in keys {
            self.dupes.track(key, self.runner.as_ref());
        }
        let Some(found) = self.io(self.backend.do_get_multi(keys, flags)) else {
            return HashMap::new();
        };
        found
            .into_iter()
            .filter_map(|(key, raw)| {
                let value = self.resolve_segments(&key, &raw, flags)?;
                Some((key, value))
            })
            .collect()
    }

    /// Fetch a value, computing and storing it on a miss.
    ///
    /// `callback` returning `None` means "nothing to cache"; the miss is
    /// passed through.
    pub fn get_with_set_callback<F>(&self, key: &str, ttl: Ttl, flags: Flags, callback: F) -> Option<Value>
    where
        F: FnOnce() -> Option<Value>,
    {
        if let Some(value) = self.get(key, flags) {
            return Some(value);
        }
        let value = callback()?;
        self.set(key, &value, ttl, flags);
        Some(value)
    }

    // ---- Writes ----

    /// Store a value. With `WRITE_ALLOW_SEGMENTS`, values larger than the
    /// segmentation size are split into segments first.
    pub fn set(&self, key: &str, value: &Value, ttl: Ttl, flags: Flags) -> bool {
        let Some(entry) = self.make_value_or_segments(key, value, ttl, flags) else {
            return false;
        };
        let started = Instant::now();
        let stored = self
            .io(self.backend.do_set(key, &entry, ttl, flags))
            .unwrap_or(false);
        self.check_sync_latency(key, flags, started);
        stored
    }

    /// Store a value only if the key does not exist yet.
    pub fn add(&self, key: &str, value: &Value, ttl: Ttl, flags: Flags) -> bool {
        // Segments are written before the add so a lost race cannot leave
        // the main key pointing at missing chunks.
        let Some(entry) = self.make_value_or_segments(key, value, ttl, flags) else {
            return false;
        };
        self.io(self.backend.add(key, &entry, ttl, flags))
            .unwrap_or(false)
    }

    /// Store several values. Segmentation is not available for batches.
    pub fn set_multi(&self, entries: &[(String, Value)], ttl: Ttl, flags: Flags) -> CacheResult<bool> {
        if flags.contains(Flags::WRITE_ALLOW_SEGMENTS) {
            return Err(CacheError::InvalidUsage(
                "set_multi does not support WRITE_ALLOW_SEGMENTS".into(),
            ));
        }
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let Some(bytes) = self.codec(key, encode_value(value)) else {
                return Ok(false);
            };
            encoded.push((key.clone(), bytes));
        }
        Ok(self.set_encoded_multi(&encoded, ttl, flags))
    }

    pub(crate) fn set_encoded_multi(&self, entries: &[(String, Vec<u8>)], ttl: Ttl, flags: Flags) -> bool {
        let started = Instant::now();
        let stored = self
            .io(self.backend.do_set_multi(entries, ttl, flags))
            .unwrap_or(false);
        if let Some((first, _)) = entries.first() {
            self.check_sync_latency(first, flags, started);
        }
        stored
    }

    /// Delete several keys. Segment pruning is not available for batches.
    pub fn delete_multi(&self, keys: &[String], flags: Flags) -> CacheResult<bool> {
        if flags.contains(Flags::WRITE_PRUNE_SEGMENTS) {
            return Err(CacheError::InvalidUsage(
                "delete_multi does not support WRITE_PRUNE_SEGMENTS".into(),
            ));
        }
        Ok(self
            .io(self.backend.do_delete_multi(keys, flags))
            .unwrap_or(false))
    }

    /// Change the TTL of an existing key. A zero TTL deletes it, pruning
    /// segments when `WRITE_PRUNE_SEGMENTS` is given. The chunks of a
    /// segmented value get the new TTL before the main key does.
    pub fn change_ttl(&self, key: &str, ttl: Ttl, flags: Flags) -> bool {
        if !self.lock(key, Duration::ZERO, DEFAULT_LOCK_EXPIRY, "") {
            return false;
        }
        let ok = match self.io(self.backend.do_get(key, Flags::READ_LATEST)) {
            Some(Some(_)) if ttl.is_expired() => self.delete(key, flags),
            Some(Some(raw)) => {
                self.refresh_segment_ttls(key, &raw, ttl, flags)
                    && self
                        .io(self.backend.do_set(key, &raw, ttl, flags))
                        .unwrap_or(false)
            }
            _ => false,
        };
        self.unlock(key);
        ok
    }

    /// Warn when a `WRITE_SYNC` write started at `started` took longer than
    /// the sync timeout. Returns whether it did.
    pub(crate) fn check_sync_latency(&self, key: &str, flags: Flags, started: Instant) -> bool {
        if !flags.contains(Flags::WRITE_SYNC) {
            return false;
        }
        let elapsed = started.elapsed();
        if elapsed <= self.config.sync_timeout {
            return false;
        }
        warn!(
            key,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = self.config.sync_timeout.as_millis() as u64,
            "synchronous write exceeded sync timeout"
        );
        true
    }

    // ---- Counters ----

    /// Add `delta` to an integer value. `None` if the key is missing, not an
    /// integer, or the backend failed.
    pub fn incr(&self, key: &str, delta: i64, flags: Flags) -> Option<i64> {
        match self.backend.incr(key, delta) {
            Ok(n) => n,
            Err(BackendError::Unsupported(_)) => self.incr_emulated(key, delta, flags),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    pub fn decr(&self, key: &str, delta: i64, flags: Flags) -> Option<i64> {
        self.incr(key, delta.saturating_neg(), flags)
    }

    /// Increment, creating the key with `init` (default: `step`) if it does
    /// not exist yet.
    pub fn incr_with_init(
        &self,
        key: &str,
        ttl: Ttl,
        step: i64,
        init: Option<i64>,
        flags: Flags,
    ) -> Option<i64> {
        let init = init.unwrap_or(step);
        self.clear_last_error();
        if let Some(n) = self.incr(key, step, flags) {
            return Some(n);
        }
        if self.errors.is_set() {
            return None;
        }
        if self.add(key, &Value::Int(init), ttl, flags) {
            return Some(init);
        }
        if self.errors.is_set() {
            return None;
        }
        // Lost the race to initialize; someone else created it.
        self.incr(key, step, flags)
    }

    /// Lock-protected read-modify-write for backends without native incr.
    ///
    /// The entry is rewritten without a TTL, since the remaining lifetime is
    /// not observable through the primitives.
    fn incr_emulated(&self, key: &str, delta: i64, flags: Flags) -> Option<i64> {
        if !self.lock(key, INCR_LOCK_TIMEOUT, DEFAULT_LOCK_EXPIRY, "") {
            return None;
        }
        let next = match self.io(self.backend.do_get(key, Flags::READ_LATEST)) {
            Some(Some(raw)) => match decode_stored(&raw) {
                Ok(Stored::Int(n)) => Some(n.saturating_add(delta).max(0)),
                _ => None,
            },
            _ => None,
        };
        let result = next.filter(|n| {
            self.io(self.backend.do_set(key, &encode_int(*n), Ttl::Indefinite, flags))
                .unwrap_or(false)
        });
        self.unlock(key);
        result
    }
}

impl std::fmt::Debug for StashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StashClient")
            .field("keyspace", &self.config.keyspace)
            .field("last_error", &self.errors.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_backend::InMemoryBackend;

    fn setup() -> (Arc<InMemoryBackend>, StashClient) {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheConfig::with_keyspace("test").unwrap();
        let client = StashClient::new(backend.clone(), config).unwrap();
        (backend, client)
    }

    // -----------------------------------------------------------------------
    // get / set / add / delete
    // -----------------------------------------------------------------------

    #[test]
    fn set_then_get_round_trips() {
        let (_, client) = setup();
        let key = client.make_key(["page", "Main Page"]);
        assert_eq!(key, "test:page:Main_Page");

        let value = Value::from("hello");
        assert!(client.set(&key, &value, Ttl::Indefinite, Flags::NONE));
        assert_eq!(client.get(&key, Flags::NONE), Some(value));
    }

    #[test]
    fn structured_values_via_json() {
        let (_, client) = setup();
        let doc = serde_json::json!({ "title": "Main Page", "revisions": [1, 2, 3] });
        let value = Value::from_json(&doc).unwrap();
        assert!(client.set("doc", &value, Ttl::HOUR, Flags::NONE));
        let back: serde_json::Value = client.get("doc", Flags::NONE).unwrap().to_json().unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn ints_are_stored_natively() {
        let (backend, client) = setup();
        assert!(client.set("n", &Value::Int(12), Ttl::Indefinite, Flags::WRITE_ALLOW_SEGMENTS));
        assert_eq!(backend.raw("n"), Some(b"12".to_vec()));
        assert_eq!(client.get("n", Flags::NONE), Some(Value::Int(12)));
    }

    #[test]
    fn miss_is_not_an_error() {
        let (_, client) = setup();
        assert_eq!(client.get("absent", Flags::NONE), None);
        assert_eq!(client.last_error_kind(), CacheErrorKind::None);
    }

    #[test]
    fn io_failure_is_recorded() {
        let (backend, client) = setup();
        backend.set_unreachable(true);
        assert_eq!(client.get("k", Flags::NONE), None);
        assert_eq!(client.last_error_kind(), CacheErrorKind::Unreachable);
        assert!(!client.set("k", &Value::from("v"), Ttl::Indefinite, Flags::NONE));
        client.clear_last_error();
        assert!(client.last_error().is_none());
    }

    #[test]
    fn add_does_not_overwrite() {
        let (_, client) = setup();
        assert!(client.add("k", &Value::from("first"), Ttl::Indefinite, Flags::NONE));
        assert!(!client.add("k", &Value::from("second"), Ttl::Indefinite, Flags::NONE));
        assert_eq!(client.get("k", Flags::NONE), Some(Value::from("first")));
        assert_eq!(client.last_error_kind(), CacheErrorKind::None);
    }

    #[test]
    fn corrupt_value_reads_as_miss_with_error() {
        let (backend, client) = setup();
        backend.do_set("k", &[0xff, 0xff, 0xff, 0xff], Ttl::Indefinite, Flags::NONE).unwrap();
        assert_eq!(client.get("k", Flags::NONE), None);
        assert_eq!(client.last_error_kind(), CacheErrorKind::Unexpected);
    }

    #[test]
    fn get_with_set_callback_fills_on_miss() {
        let (_, client) = setup();
        let mut calls = 0;
        let v = client.get_with_set_callback("k", Ttl::MINUTE, Flags::NONE, || {
            calls += 1;
            Some(Value::from("computed"))
        });
        assert_eq!(v, Some(Value::from("computed")));
        let v = client.get_with_set_callback("k", Ttl::MINUTE, Flags::NONE, || {
            calls += 1;
            Some(Value::from("recomputed"))
        });
        assert_eq!(v, Some(Value::from("computed")));
        assert_eq!(calls, 1);
    }

    #[test]
    fn get_with_set_callback_none_caches_nothing() {
        let (backend, client) = setup();
        assert_eq!(client.get_with_set_callback("k", Ttl::MINUTE, Flags::NONE, || None), None);
        assert!(!backend.contains("k"));
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    #[test]
    fn multi_round_trip() {
        let (_, client) = setup();
        let entries = vec![
            ("a".to_string(), Value::from("1")),
            ("b".to_string(), Value::Int(2)),
        ];
        assert!(client.set_multi(&entries, Ttl::Indefinite, Flags::NONE).unwrap());

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = client.get_multi(&keys, Flags::NONE);
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Value::from("1"));
        assert_eq!(found["b"], Value::Int(2));

        assert!(client.delete_multi(&keys, Flags::NONE).unwrap());
        assert!(client.get_multi(&keys, Flags::NONE).is_empty());
    }

    #[test]
    fn batch_misuse_fails_fast() {
        let (_, client) = setup();
        assert!(matches!(
            client.set_multi(&[], Ttl::Indefinite, Flags::WRITE_ALLOW_SEGMENTS),
            Err(CacheError::InvalidUsage(_))
        ));
        assert!(matches!(
            client.delete_multi(&[], Flags::WRITE_PRUNE_SEGMENTS),
            Err(CacheError::InvalidUsage(_))
        ));
    }

    // -----------------------------------------------------------------------
    // TTL
    // -----------------------------------------------------------------------

    #[test]
    fn change_ttl_rewrites_or_deletes() {
        let (backend, client) = setup();
        client.set("k", &Value::from("v"), Ttl::MINUTE, Flags::NONE);
        assert!(client.change_ttl("k", Ttl::HOUR, Flags::NONE));
        assert_eq!(client.get("k", Flags::NONE), Some(Value::from("v")));

        assert!(client.change_ttl("k", Ttl::secs(0), Flags::NONE));
        assert!(!backend.contains("k"));
        assert!(!client.change_ttl("k", Ttl::HOUR, Flags::NONE));
        // The lock taken internally is released.
        assert!(!backend.contains("k:lock"));
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    #[test]
    fn incr_and_decr() {
        let (_, client) = setup();
        assert_eq!(client.incr("n", 1, Flags::NONE), None);
        client.set("n", &Value::Int(10), Ttl::Indefinite, Flags::NONE);
        assert_eq!(client.incr("n", 5, Flags::NONE), Some(15));
        assert_eq!(client.decr("n", 20, Flags::NONE), Some(0));
        assert_eq!(client.get("n", Flags::NONE), Some(Value::Int(0)));
    }

    #[test]
    fn incr_emulated_without_native_support() {
        let backend = Arc::new(InMemoryBackend::without_native_incr());
        let client = StashClient::new(backend.clone(), CacheConfig::default()).unwrap();
        client.set("n", &Value::Int(1), Ttl::Indefinite, Flags::NONE);
        assert_eq!(client.incr("n", 2, Flags::NONE), Some(3));
        assert_eq!(client.decr("n", 1, Flags::NONE), Some(2));
        assert_eq!(client.incr("missing", 1, Flags::NONE), None);
        assert!(!backend.contains("n:lock"));
    }

    #[test]
    fn incr_on_non_integer_is_a_miss() {
        let (_, client) = setup();
        client.set("s", &Value::from("text"), Ttl::Indefinite, Flags::NONE);
        assert_eq!(client.incr("s", 1, Flags::NONE), None);
    }

    #[test]
    fn incr_with_init_creates_then_increments() {
        let (_, client) = setup();
        assert_eq!(client.incr_with_init("n", Ttl::MINUTE, 1, Some(5), Flags::NONE), Some(5));
        assert_eq!(client.incr_with_init("n", Ttl::MINUTE, 1, Some(5), Flags::NONE), Some(6));
        assert_eq!(client.incr_with_init("m", Ttl::MINUTE, 3, None, Flags::NONE), Some(3));
    }

    #[test]
    fn incr_with_init_stops_on_io_error() {
        let (backend, client) = setup();
        backend.set_unreachable(true);
        assert_eq!(client.incr_with_init("n", Ttl::MINUTE, 1, None, Flags::NONE), None);
        assert_eq!(client.last_error_kind(), CacheErrorKind::Unreachable);
    }

    // -----------------------------------------------------------------------
    // Builder / diagnostics
    // -----------------------------------------------------------------------

    #[test]
    fn builder_rejects_invalid_config() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            segmentation_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            StashClient::builder(backend).config(config).build(),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn repeated_gets_are_reported_once() {
        let (_, client) = setup();
        client.get("k", Flags::NONE);
        client.get("k", Flags::NONE);
        assert!(client.dupes.report_scheduled());
        // The default runner reports inline, after which lookups are ignored.
        client.get_multi(&["k".to_string()], Flags::NONE);
        assert_eq!(client.dupes.repeats("k"), 0);
    }

    // -----------------------------------------------------------------------
    // Synchronous writes
    // -----------------------------------------------------------------------

    /// Delays every write by a fixed amount.
    struct SlowBackend {
        inner: InMemoryBackend,
        delay: Duration,
    }

    impl CacheBackend for SlowBackend {
        fn do_get(&self, key: &str, flags: Flags) -> BackendResult<Option<Vec<u8>>> {
            self.inner.do_get(key, flags)
        }

        fn do_set(&self, key: &str, value: &[u8], ttl: Ttl, flags: Flags) -> BackendResult<bool> {
            std::thread::sleep(self.delay);
            self.inner.do_set(key, value, ttl, flags)
        }

        fn do_delete(&self, key: &str, flags: Flags) -> BackendResult<bool> {
            self.inner.do_delete(key, flags)
        }

        fn add(&self, key: &str, value: &[u8], ttl: Ttl, flags: Flags) -> BackendResult<bool> {
            self.inner.add(key, value, ttl, flags)
        }
    }

    fn slow_client() -> StashClient {
        let backend = Arc::new(SlowBackend {
            inner: InMemoryBackend::new(),
            delay: Duration::from_millis(20),
        });
        let config = CacheConfig {
            sync_timeout: Duration::from_millis(5),
            ..Default::default()
        };
        StashClient::new(backend, config).unwrap()
    }

    #[test]
    fn slow_sync_write_is_flagged() {
        let client = slow_client();
        let started = Instant::now();
        assert!(client.set("k", &Value::from("v"), Ttl::Indefinite, Flags::WRITE_SYNC));
        assert!(client.check_sync_latency("k", Flags::WRITE_SYNC, started));
        // The warning never turns a stored write into a failure.
        assert_eq!(client.get("k", Flags::NONE), Some(Value::from("v")));
        assert_eq!(client.last_error_kind(), CacheErrorKind::None);
    }

    #[test]
    fn only_sync_writes_are_timed() {
        let client = slow_client();
        let started = Instant::now();
        assert!(client.set("k", &Value::from("v"), Ttl::Indefinite, Flags::NONE));
        assert!(!client.check_sync_latency("k", Flags::NONE, started));

        let (_, fast) = setup();
        let started = Instant::now();
        assert!(fast.set("k", &Value::from("v"), Ttl::Indefinite, Flags::WRITE_SYNC));
        assert!(!fast.check_sync_latency("k", Flags::WRITE_SYNC, started));
    }

    #[test]
    fn unbounded_ttl_is_stored() {
        let (backend, client) = setup();
        assert!(client.set("k", &Value::from("v"), Ttl::After(Duration::MAX), Flags::NONE));
        assert!(backend.contains("k"));
        assert_eq!(client.get("k", Flags::NONE), Some(Value::from("v")));
    }

    #[test]
    fn global_keys() {
        let (_, client) = setup();
        assert_eq!(client.make_global_key("segment", ["k", "h"]), "global:segment:k:h");
        assert_eq!(client.keyspace().as_str(), "test");
    }
}
