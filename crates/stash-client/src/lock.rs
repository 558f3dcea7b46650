//! Advisory locks built on the backend's atomic `add`.
//!
//! A lock on `key` is the backend entry `"<key>:lock"`, created with `add`
//! and an expiry so a crashed holder cannot block others forever. Each
//! client keeps a local record of the locks it holds; taking a lock again
//! with the same non-empty reentry class only bumps a depth counter, and the
//! backend entry is deleted when the depth drops back to zero.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use stash_types::{lock_key, Flags, Ttl};
use tracing::{debug, warn};

use crate::client::StashClient;

/// Expiry used when an operation takes a lock internally.
pub(crate) const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(6);

/// Locks never outlive a day.
pub const MAX_LOCK_EXPIRY: Duration = Duration::from_secs(86_400);

/// Allowance for clock skew and network latency when deciding whether a
/// scoped lock may still be ours to delete.
const RELEASE_MARGIN: Duration = Duration::from_millis(50);

const INITIAL_WAIT: Duration = Duration::from_millis(1);
const MAX_WAIT: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Local bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LockRecord {
    class: String,
    depth: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reentry {
    /// Already held with the same class; depth was bumped.
    Reentered,
    /// Held with a different (or empty) class.
    Conflict,
    NotHeld,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Release {
    NotHeld,
    /// Depth decreased but the lock is still held.
    StillHeld,
    /// Depth reached zero; the record is gone.
    Released,
}

/// Locks held by one client, keyed by the locked key.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<String, LockRecord>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_reenter(&self, key: &str, class: &str) -> Reentry {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get_mut(key) {
            None => Reentry::NotHeld,
            Some(record) if !class.is_empty() && record.class == class => {
                record.depth += 1;
                Reentry::Reentered
            }
            Some(_) => Reentry::Conflict,
        }
    }

    pub(crate) fn insert(&self, key: &str, class: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(
            key.to_string(),
            LockRecord {
                class: class.to_string(),
                depth: 1,
            },
        );
    }

    pub(crate) fn release(&self, key: &str) -> Release {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = held.get_mut(key) else {
            return Release::NotHeld;
        };
        record.depth -= 1;
        if record.depth > 0 {
            return Release::StillHeld;
        }
        held.remove(key);
        Release::Released
    }

    /// Current reentry depth of `key`, zero if not held.
    pub fn depth(&self, key: &str) -> u32 {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |r| r.depth)
    }

    pub fn is_empty(&self) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

// ---------------------------------------------------------------------------
// Wait loop
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitStep {
    Reached,
    Continue,
    Abort,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Reached,
    Aborted,
    TimedOut,
}

/// Polls a condition with exponential backoff until it holds, aborts, or
/// the timeout passes. A zero timeout means exactly one attempt.
pub(crate) struct WaitLoop {
    timeout: Duration,
}

impl WaitLoop {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// A timeout too large to add to the current instant waits forever.
    pub(crate) fn run(&self, mut condition: impl FnMut() -> WaitStep) -> WaitOutcome {
        let deadline = Instant::now().checked_add(self.timeout);
        let mut delay = INITIAL_WAIT;
        loop {
            match condition() {
                WaitStep::Reached => return WaitOutcome::Reached,
                WaitStep::Abort => return WaitOutcome::Aborted,
                WaitStep::Continue => {}
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    delay.min(deadline - now)
                }
                None => delay,
            };
            std::thread::sleep(pause);
            delay = (delay * 2).min(MAX_WAIT);
        }
    }
}

fn clamp_expiry(expiry: Duration) -> Duration {
    if expiry.is_zero() {
        MAX_LOCK_EXPIRY
    } else {
        expiry.min(MAX_LOCK_EXPIRY)
    }
}

// ---------------------------------------------------------------------------
// Client operations
// ---------------------------------------------------------------------------

impl StashClient {
    /// Acquire an advisory lock on `key`.
    ///
    /// Waits up to `timeout` for a competing holder. The lock expires after
    /// `expiry` (zero, or anything over a day, means one day). If this client
    /// already holds the lock, the call succeeds only when `reentry_class`
    /// is non-empty and equal to the class it was taken with.
    ///
    /// A timeout is not an error and leaves the error register untouched;
    /// a backend failure aborts the wait and is recorded.
    pub fn lock(&self, key: &str, timeout: Duration, expiry: Duration, reentry_class: &str) -> bool {
        match self.locks.try_reenter(key, reentry_class) {
            Reentry::Reentered => return true,
            Reentry::Conflict => {
                debug!(key, reentry_class, "lock already held by this client");
                return false;
            }
            Reentry::NotHeld => {}
        }

        let lock_key = lock_key(key);
        let ttl = Ttl::After(clamp_expiry(expiry));
        let outcome = WaitLoop::new(timeout).run(|| {
            match self.backend.add(&lock_key, b"1", ttl, Flags::NONE) {
                Ok(true) => WaitStep::Reached,
                Ok(false) => WaitStep::Continue,
                Err(e) => {
                    self.record(e);
                    WaitStep::Abort
                }
            }
        });

        match outcome {
            WaitOutcome::Reached => {
                self.locks.insert(key, reentry_class);
                true
            }
            WaitOutcome::TimedOut => {
                debug!(key, timeout_ms = timeout.as_millis() as u64, "lock timed out");
                false
            }
            WaitOutcome::Aborted => {
                warn!(key, "lock aborted by backend error");
                false
            }
        }
    }

    /// Release one level of a lock held by this client.
    ///
    /// Unlocking a key this client does not hold is a no-op. The backend
    /// entry is deleted once every reentrant acquisition has been released.
    pub fn unlock(&self, key: &str) -> bool {
        match self.locks.release(key) {
            Release::NotHeld | Release::StillHeld => true,
            Release::Released => {
                let ok = self
                    .io(self.backend.do_delete(&lock_key(key), Flags::NONE))
                    .unwrap_or(false);
                if !ok {
                    warn!(key, "unlock failed");
                }
                ok
            }
        }
    }

    /// Acquire a lock released when the returned guard is dropped.
    ///
    /// If the guard outlives the lock's expiry, release does not delete the
    /// backend entry, since by then it may belong to another holder.
    pub fn scoped_lock(
        &self,
        key: &str,
        timeout: Duration,
        expiry: Duration,
        reentry_class: &str,
    ) -> Option<ScopedLock<'_>> {
        let since = Instant::now();
        let expiry = clamp_expiry(expiry);
        if !self.lock(key, timeout, expiry, reentry_class) {
            return None;
        }
        Some(ScopedLock {
            client: self,
            key: key.to_string(),
            expiry,
            since,
            released: false,
        })
    }
}

/// Guard returned by [`StashClient::scoped_lock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScopedLock<'a> {
    client: &'a StashClient,
    key: String,
    expiry: Duration,
    since: Instant,
    released: bool,
}

impl ScopedLock<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now. Returns `false` if the lock had already expired or the
    /// backend delete failed.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        let age = self.since.elapsed();
        if age + RELEASE_MARGIN >= self.expiry {
            warn!(
                key = %self.key,
                age_ms = age.as_millis() as u64,
                expiry_ms = self.expiry.as_millis() as u64,
                "lock held too long; leaving backend entry alone"
            );
            self.client.locks.release(&self.key);
            return false;
        }
        self.client.unlock(&self.key)
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for ScopedLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("key", &self.key)
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::CacheErrorKind;
    use stash_backend::InMemoryBackend;
    use std::sync::Arc;

    const SEC: Duration = Duration::from_secs(1);

    fn pair() -> (Arc<InMemoryBackend>, StashClient, StashClient) {
        let backend = Arc::new(InMemoryBackend::new());
        let a = StashClient::new(backend.clone(), CacheConfig::default()).unwrap();
        let b = StashClient::new(backend.clone(), CacheConfig::default()).unwrap();
        (backend, a, b)
    }

    // -----------------------------------------------------------------------
    // Registry / wait loop
    // -----------------------------------------------------------------------

    #[test]
    fn registry_tracks_depth() {
        let reg = LockRegistry::new();
        assert_eq!(reg.try_reenter("k", "c"), Reentry::NotHeld);
        reg.insert("k", "c");
        assert_eq!(reg.try_reenter("k", "c"), Reentry::Reentered);
        assert_eq!(reg.try_reenter("k", "other"), Reentry::Conflict);
        assert_eq!(reg.depth("k"), 2);
        assert_eq!(reg.release("k"), Release::StillHeld);
        assert_eq!(reg.release("k"), Release::Released);
        assert_eq!(reg.release("k"), Release::NotHeld);
        assert!(reg.is_empty());
    }

    #[test]
    fn empty_class_never_reenters() {
        let reg = LockRegistry::new();
        reg.insert("k", "");
        assert_eq!(reg.try_reenter("k", ""), Reentry::Conflict);
    }

    #[test]
    fn zero_timeout_tries_once() {
        let mut calls = 0;
        let outcome = WaitLoop::new(Duration::ZERO).run(|| {
            calls += 1;
            WaitStep::Continue
        });
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(calls, 1);
    }

    #[test]
    fn wait_loop_retries_until_reached() {
        let mut calls = 0;
        let outcome = WaitLoop::new(SEC).run(|| {
            calls += 1;
            if calls == 3 {
                WaitStep::Reached
            } else {
                WaitStep::Continue
            }
        });
        assert_eq!(outcome, WaitOutcome::Reached);
        assert_eq!(calls, 3);
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let mut calls = 0;
        let outcome = WaitLoop::new(Duration::MAX).run(|| {
            calls += 1;
            if calls == 3 {
                WaitStep::Reached
            } else {
                WaitStep::Continue
            }
        });
        assert_eq!(outcome, WaitOutcome::Reached);
    }

    #[test]
    fn wait_loop_abort_stops_immediately() {
        let mut calls = 0;
        let outcome = WaitLoop::new(SEC).run(|| {
            calls += 1;
            WaitStep::Abort
        });
        assert_eq!(outcome, WaitOutcome::Aborted);
        assert_eq!(calls, 1);
    }

    #[test]
    fn expiry_is_clamped() {
        assert_eq!(clamp_expiry(Duration::ZERO), MAX_LOCK_EXPIRY);
        assert_eq!(clamp_expiry(MAX_LOCK_EXPIRY * 2), MAX_LOCK_EXPIRY);
        assert_eq!(clamp_expiry(SEC), SEC);
    }

    // -----------------------------------------------------------------------
    // lock / unlock
    // -----------------------------------------------------------------------

    #[test]
    fn lock_excludes_other_clients() {
        let (backend, a, b) = pair();
        assert!(a.lock("k", Duration::ZERO, SEC, ""));
        assert!(backend.contains("k:lock"));
        assert!(!b.lock("k", Duration::from_millis(20), SEC, ""));
        assert_eq!(b.last_error_kind(), CacheErrorKind::None);

        assert!(a.unlock("k"));
        assert!(!backend.contains("k:lock"));
        assert!(b.lock("k", Duration::ZERO, SEC, ""));
    }

    #[test]
    fn reentrant_lock_needs_matching_class() {
        let (backend, a, _) = pair();
        assert!(a.lock("k", Duration::ZERO, SEC, "job"));
        assert!(a.lock("k", Duration::ZERO, SEC, "job"));
        assert!(!a.lock("k", Duration::ZERO, SEC, "other"));
        assert_eq!(a.locks.depth("k"), 2);

        assert!(a.unlock("k"));
        assert!(backend.contains("k:lock"));
        assert!(a.unlock("k"));
        assert!(!backend.contains("k:lock"));
    }

    #[test]
    fn unlock_of_unheld_key_is_noop() {
        let (backend, a, b) = pair();
        assert!(b.lock("k", Duration::ZERO, SEC, ""));
        assert!(a.unlock("k"));
        // b's lock is untouched.
        assert!(backend.contains("k:lock"));
    }

    #[test]
    fn lock_waits_for_expiry() {
        let (_, a, b) = pair();
        assert!(a.lock("k", Duration::ZERO, Duration::from_millis(30), ""));
        assert!(b.lock("k", SEC, SEC, ""));
    }

    #[test]
    fn lock_with_unbounded_timeout() {
        let (backend, a, b) = pair();
        assert!(a.lock("k", Duration::MAX, SEC, ""));
        assert!(backend.contains("k:lock"));
        assert!(a.unlock("k"));
        let guard = b.scoped_lock("k", Duration::MAX, Duration::MAX, "").unwrap();
        assert!(guard.release());
    }

    #[test]
    fn backend_failure_aborts_lock() {
        let (backend, a, _) = pair();
        backend.set_unreachable(true);
        assert!(!a.lock("k", SEC, SEC, ""));
        assert_eq!(a.last_error_kind(), CacheErrorKind::Unreachable);
        assert_eq!(a.locks.depth("k"), 0);
    }

    // -----------------------------------------------------------------------
    // Scoped locks
    // -----------------------------------------------------------------------

    #[test]
    fn scoped_lock_releases_on_drop() {
        let (backend, a, b) = pair();
        {
            let guard = a.scoped_lock("k", Duration::ZERO, SEC, "").unwrap();
            assert_eq!(guard.key(), "k");
            assert!(b.scoped_lock("k", Duration::ZERO, SEC, "").is_none());
        }
        assert!(!backend.contains("k:lock"));
        let guard = b.scoped_lock("k", Duration::ZERO, SEC, "").unwrap();
        assert!(guard.release());
        assert!(!backend.contains("k:lock"));
    }

    #[test]
    fn reentrant_scoped_lock_keeps_outer_hold() {
        let (backend, a, b) = pair();
        assert!(a.lock("k", Duration::ZERO, SEC, "job"));
        {
            let inner = a.scoped_lock("k", Duration::ZERO, SEC, "job").unwrap();
            assert_eq!(a.locks.depth("k"), 2);
            drop(inner);
        }
        assert_eq!(a.locks.depth("k"), 1);
        assert!(backend.contains("k:lock"));
        assert!(!b.lock("k", Duration::ZERO, SEC, ""));

        assert!(a.unlock("k"));
        assert!(!backend.contains("k:lock"));
    }

    #[test]
    fn expired_scoped_lock_leaves_new_holder_alone() {
        let (backend, a, b) = pair();
        let guard = a
            .scoped_lock("k", Duration::ZERO, Duration::from_millis(30), "")
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.lock("k", Duration::ZERO, SEC, ""));

        assert!(!guard.release());
        assert!(backend.contains("k:lock"));
        assert!(a.locks.is_empty());
    }
}
