//! Cache key construction.
//!
//! A key is a keyspace followed by colon-separated components:
//!
//! - `%` inside a component is written as `%25`
//! - `:` inside a component is written as `%3A`
//! - spaces anywhere in the final key become `_`
//!
//! Scoped keys use the client's own keyspace. Global keys use the fixed
//! [`GLOBAL_KEYSPACE`] so that every client sharing a backend can address
//! them (segment chunks live there).

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Keyspace shared by all clients of a backend.
pub const GLOBAL_KEYSPACE: &str = "global";

/// Suffix of the backend entry that backs an advisory lock.
const LOCK_SUFFIX: &str = ":lock";

/// Escape a single key component so it cannot introduce a separator.
pub fn escape_component(component: &str) -> Cow<'_, str> {
    if !component.contains(['%', ':']) {
        return Cow::Borrowed(component);
    }
    Cow::Owned(component.replace('%', "%25").replace(':', "%3A"))
}

/// The backend key that holds the advisory lock for `key`.
pub fn lock_key(key: &str) -> String {
    format!("{key}{LOCK_SUFFIX}")
}

fn make_key_internal<'a, I>(keyspace: &str, components: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut key = String::from(keyspace);
    for component in components {
        key.push(':');
        key.push_str(&escape_component(component));
    }
    key.replace(' ', "_")
}

/// Scoping prefix for one client instance.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keyspace(String);

impl Keyspace {
    /// Create a keyspace. It must be non-empty and contain no `:`.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::InvalidKeyspace(name, "must not be empty"));
        }
        if name.contains(':') {
            return Err(TypeError::InvalidKeyspace(name, "must not contain ':'"));
        }
        Ok(Self(name))
    }

    /// The keyspace used for backend-wide keys.
    pub fn global() -> Self {
        Self(GLOBAL_KEYSPACE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Make a key scoped to this keyspace.
    pub fn make_key<'a, I>(&self, components: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        make_key_internal(&self.0, components)
    }

    /// Make a key in the global keyspace, regardless of `self`.
    pub fn make_global_key<'a, I>(&self, collection: &'a str, components: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        make_key_internal(
            GLOBAL_KEYSPACE,
            std::iter::once(collection).chain(components),
        )
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self("local".to_string())
    }
}

impl TryFrom<String> for Keyspace {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Keyspace> for String {
    fn from(keyspace: Keyspace) -> Self {
        keyspace.0
    }
}

impl fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keyspace({})", self.0)
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scoped_key() {
        let ks = Keyspace::new("wiki").unwrap();
        assert_eq!(ks.make_key(["user", "42"]), "wiki:user:42");
    }

    #[test]
    fn global_key_ignores_keyspace() {
        let ks = Keyspace::new("wiki").unwrap();
        assert_eq!(
            ks.make_global_key("segment", ["wiki:k", "abcd"]),
            "global:segment:wiki%3Ak:abcd"
        );
    }

    #[test]
    fn separators_and_percent_are_escaped() {
        assert_eq!(escape_component("a:b"), "a%3Ab");
        assert_eq!(escape_component("50%"), "50%25");
        assert_eq!(escape_component("%3A"), "%253A");
        assert!(matches!(escape_component("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn spaces_become_underscores() {
        let ks = Keyspace::new("wiki").unwrap();
        assert_eq!(ks.make_key(["Main Page"]), "wiki:Main_Page");
    }

    #[test]
    fn no_components() {
        let ks = Keyspace::new("wiki").unwrap();
        assert_eq!(ks.make_key([]), "wiki");
    }

    #[test]
    fn lock_key_appends_suffix() {
        assert_eq!(lock_key("wiki:user:42"), "wiki:user:42:lock");
    }

    #[test]
    fn invalid_keyspaces_rejected() {
        assert!(Keyspace::new("").is_err());
        assert!(Keyspace::new("a:b").is_err());
        assert_eq!(Keyspace::default().as_str(), "local");
    }

    #[test]
    fn keyspace_serde_validates() {
        let ks: Keyspace = serde_json::from_str("\"wiki\"").unwrap();
        assert_eq!(ks.as_str(), "wiki");
        assert!(serde_json::from_str::<Keyspace>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn escaped_component_has_no_separator(component in ".*") {
            let escaped = escape_component(&component);
            prop_assert!(!escaped.contains(':'));
        }

        #[test]
        fn component_count_is_preserved(components in prop::collection::vec("[a-z:% ]{0,8}", 0..6)) {
            let ks = Keyspace::new("ks").unwrap();
            let key = ks.make_key(components.iter().map(String::as_str));
            prop_assert_eq!(key.split(':').count(), components.len() + 1);
        }
    }
}
