//! Foundation types for Stash.
//!
//! Every other Stash crate depends on `stash-types`. Nothing in here talks to
//! a backend; these are the vocabulary types shared by the codec, the
//! backend trait and the client.
//!
//! # Key Types
//!
//! - [`Keyspace`] -- Scoping prefix that turns key components into cache keys
//! - [`Flags`] -- Combinable read/write behavior bitfield
//! - [`Ttl`] -- Entry lifetime (indefinite or relative)
//! - [`Value`] -- Application value: native integer or opaque bytes
//! - [`CasToken`] -- Opaque read-time fingerprint for conditional writes

pub mod cas;
pub mod error;
pub mod flags;
pub mod keys;
pub mod ttl;
pub mod value;

pub use cas::CasToken;
pub use error::TypeError;
pub use flags::Flags;
pub use keys::{escape_component, lock_key, Keyspace, GLOBAL_KEYSPACE};
pub use ttl::Ttl;
pub use value::Value;
