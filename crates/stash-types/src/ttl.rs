use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifetime of a cache entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ttl {
    /// The entry never expires (it may still be evicted).
    #[default]
    Indefinite,
    /// The entry expires this long after it was written.
    After(Duration),
}

impl Ttl {
    pub const MINUTE: Self = Self::After(Duration::from_secs(60));
    pub const HOUR: Self = Self::After(Duration::from_secs(3600));
    pub const DAY: Self = Self::After(Duration::from_secs(86_400));

    /// Relative TTL in whole seconds.
    pub const fn secs(secs: u64) -> Self {
        Self::After(Duration::from_secs(secs))
    }

    /// The relative duration, or `None` if indefinite.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Indefinite => None,
            Self::After(d) => Some(*d),
        }
    }

    /// A zero relative TTL: the entry is already expired when written.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::After(d) if d.is_zero())
    }

    /// Absolute expiry for a write performed at `now`. `None` means the
    /// entry never expires, including when the deadline is past what an
    /// `Instant` can represent.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        self.as_duration().and_then(|d| now.checked_add(d))
    }
}
