//! Atomic read-modify-write.
//!
//! [`StashClient::merge`] reads the current value with a CAS token, asks the
//! caller for the replacement, and writes it back with `add` (no current
//! value) or compare-and-swap. A lost race retries with a fresh read, up to
//! the caller's attempt limit. Any I/O or codec failure ends the merge.

use std::time::Duration;

use stash_backend::BackendError;
use stash_types::{CasToken, Flags, Ttl, Value};
use tracing::{debug, warn};

use crate::client::StashClient;
use crate::lock::DEFAULT_LOCK_EXPIRY;

/// What a merge callback wants done with the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Store `value` with `ttl`.
    Store { value: Value, ttl: Ttl },
    /// Leave the key alone. The merge counts as successful.
    Skip,
}

impl MergeOutcome {
    pub fn store(value: impl Into<Value>, ttl: Ttl) -> Self {
        Self::Store {
            value: value.into(),
            ttl,
        }
    }
}

impl StashClient {
    /// Atomically replace the value of `key` with `transform(current, ttl)`.
    ///
    /// `transform` sees `None` when the key is absent. It may be called once
    /// per attempt, so it must be free of side effects that cannot be
    /// repeated. At least one attempt is always made.
    ///
    /// Returns `true` if the new value was stored or the callback skipped.
    /// Returns `false` when every attempt lost a race or on a backend or
    /// codec failure, which is also recorded in the error register.
    pub fn merge<F>(&self, key: &str, mut transform: F, ttl: Ttl, attempts: u32, flags: Flags) -> bool
    where
        F: FnMut(Option<&Value>, Ttl) -> MergeOutcome,
    {
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                if let Some(backoff) = self.config.merge_backoff {
                    std::thread::sleep(backoff);
                }
            }
            self.clear_last_error();

            let Some(found) = self.io(self.backend.do_get_with_token(key, Flags::READ_LATEST)) else {
                return false;
            };
            let (current, token) = match found {
                Some((raw, token)) => (self.resolve_segments(key, &raw, Flags::READ_LATEST), Some(token)),
                None => (None, None),
            };
            if self.errors.is_set() {
                warn!(key, "merge aborted: could not read current value");
                return false;
            }

            let (value, new_ttl) = match transform(current.as_ref(), ttl) {
                MergeOutcome::Skip => return true,
                MergeOutcome::Store { value, ttl } => (value, ttl),
            };
            // A retry that computes what is already stored has nothing to do.
            if attempt > 0 && current.as_ref() == Some(&value) {
                return true;
            }

            // A token without a usable value (e.g. lost segments) still
            // means the key exists, so it must be replaced via CAS.
            let stored = match token {
                None => self.add(key, &value, new_ttl, flags),
                Some(token) => self.cas(&token, key, &value, new_ttl, flags),
            };
            if stored {
                return true;
            }
            if self.errors.is_set() {
                warn!(key, attempt, "merge aborted by backend error");
                return false;
            }
            debug!(key, attempt, "merge lost a race");
        }
        warn!(key, attempts, "merge gave up after exhausting attempts");
        false
    }

    /// Store `value` only if `key` still matches `token`.
    ///
    /// Segments, if any, are written before the swap. A lost race can leave
    /// them orphaned until they expire.
    pub(crate) fn cas(&self, token: &CasToken, key: &str, value: &Value, ttl: Ttl, flags: Flags) -> bool {
        let Some(entry) = self.make_value_or_segments(key, value, ttl, flags) else {
            return false;
        };
        match self.backend.do_cas(key, token, &entry, ttl, flags) {
            Ok(stored) => stored,
            Err(BackendError::Unsupported(_)) => self.cas_emulated(token, key, &entry, ttl, flags),
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// CAS for backends without a native one: take the key's lock without
    /// waiting, compare tokens, write.
    fn cas_emulated(&self, token: &CasToken, key: &str, entry: &[u8], ttl: Ttl, flags: Flags) -> bool {
        if !self.lock(key, Duration::ZERO, DEFAULT_LOCK_EXPIRY, "") {
            return false;
        }
        let stored = match self.io(self.backend.do_get_with_token(key, Flags::READ_LATEST)) {
            Some(Some((_, current))) if current == *token => self
                .io(self.backend.do_set(key, entry, ttl, flags))
                .unwrap_or(false),
            Some(_) => {
                debug!(key, "CAS failed due to race");
                false
            }
            None => false,
        };
        self.unlock(key);
        stored
    }
}
