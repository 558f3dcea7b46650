//! Backend-agnostic cache client.
//!
//! [`StashClient`] layers cache semantics over any [`CacheBackend`] that
//! offers atomic `add`:
//!
//! - **Segmentation**: large byte values written with `WRITE_ALLOW_SEGMENTS`
//!   are split into content-hashed chunks under global keys.
//! - **Merge**: atomic read-modify-write via native or emulated CAS.
//! - **Locks**: reentrant advisory locks with expiry, plus scoped guards.
//! - **Counters**: `incr`/`decr`, emulated under a lock when the backend has
//!   no native increment.
//! - **Diagnostics**: a per-client last-error register and duplicate-lookup
//!   reporting through an injected [`DeferredRunner`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use stash_client::{CacheConfig, Flags, InMemoryBackend, MergeOutcome, StashClient, Ttl, Value};
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let cache = StashClient::new(backend, CacheConfig::with_keyspace("wiki")?)?;
//!
//! let key = cache.make_key(["views", "Main Page"]);
//! cache.merge(
//!     &key,
//!     |current, ttl| MergeOutcome::store(current.and_then(Value::as_int).unwrap_or(0) + 1, ttl),
//!     Ttl::DAY,
//!     10,
//!     Flags::NONE,
//! );
//! # Ok::<(), stash_client::CacheError>(())
//! ```

pub mod client;
pub mod config;
pub mod deferred;
pub mod diagnostics;
pub mod error;
pub mod lock;
pub mod merge;
pub mod segments;

pub use client::{StashClient, StashClientBuilder};
pub use config::CacheConfig;
pub use deferred::{DeferredRunner, DeferredTask, ImmediateRunner, TokioRunner};
pub use diagnostics::DupeTracker;
pub use error::{CacheError, CacheErrorKind, CacheResult, ErrorState};
pub use lock::{LockRegistry, ScopedLock, MAX_LOCK_EXPIRY};
pub use merge::MergeOutcome;

// Re-export the types every caller needs
pub use stash_backend::{BackendError, CacheBackend, InMemoryBackend};
pub use stash_types::{Flags, Keyspace, Ttl, Value};
