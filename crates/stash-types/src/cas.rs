use std::fmt;

/// Opaque token captured at read time and checked by a later conditional
/// write.
///
/// Backends with native CAS hand out their own tokens (a memcached CAS
/// unique, a row version). The portable default is a BLAKE3 digest of the
/// stored bytes, which changes whenever the stored bytes change.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CasToken(Vec<u8>);

impl CasToken {
    /// Digest-based token for a stored blob.
    pub fn of(stored: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"stash-cas-v1:");
        hasher.update(stored);
        Self(hasher.finalize().as_bytes().to_vec())
    }

    /// Wrap a backend-native token.
    pub fn from_native(raw: impl Into<Vec<u8>>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(4)];
        write!(f, "CasToken({})", hex::encode(shown))
    }
}
