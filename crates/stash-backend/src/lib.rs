//! Backend primitive interface for Stash.
//!
//! A backend is any store offering a handful of atomic key/value
//! primitives, the way memcached does. The client builds segmentation,
//! merge and locking on top of exactly these operations and nothing else.
//!
//! # Backends
//!
//! All backends implement the [`CacheBackend`] trait:
//!
//! - [`InMemoryBackend`] -- `HashMap`-based store for tests and embedding
//!
//! # Contract
//!
//! 1. `do_get` returns `Ok(None)` for absent or expired keys, never an error.
//! 2. `do_delete` succeeds whether or not the key existed.
//! 3. `add` succeeds only if the key did not exist; it is the only primitive
//!    used for mutual exclusion.
//! 4. `incr` is atomic and preserves the entry's expiry.
//! 5. I/O failures are returned as `Err`, never folded into a miss.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;
pub use traits::CacheBackend;
