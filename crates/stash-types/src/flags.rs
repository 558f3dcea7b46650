use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Read/write behavior bitfield accepted by every cache operation.
///
/// Flags combine with `|`. Backends are free to ignore flags that do not
/// apply to them (a single-node store has nothing to do for `WRITE_SYNC`),
/// but must never fail because of them.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// No special behavior.
    pub const NONE: Self = Self(0);
    /// Bypass any staleness-tolerant replica and read the latest value.
    pub const READ_LATEST: Self = Self(1);
    /// The caller detects staleness itself (informational).
    pub const READ_VERIFIED: Self = Self(2);
    /// The write must be visible across the whole access scope before returning.
    pub const WRITE_SYNC: Self = Self(4);
    /// Only write to the cache tier, not to any backing store.
    pub const WRITE_CACHE_ONLY: Self = Self(8);
    /// Allow large values to be split into content-addressed segments.
    pub const WRITE_ALLOW_SEGMENTS: Self = Self(16);
    /// On delete, also remove the segments referenced by the main key.
    pub const WRITE_PRUNE_SEGMENTS: Self = Self(32);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::READ_LATEST, "READ_LATEST"),
        (Self::READ_VERIFIED, "READ_VERIFIED"),
        (Self::WRITE_SYNC, "WRITE_SYNC"),
        (Self::WRITE_CACHE_ONLY, "WRITE_CACHE_ONLY"),
        (Self::WRITE_ALLOW_SEGMENTS, "WRITE_ALLOW_SEGMENTS"),
        (Self::WRITE_PRUNE_SEGMENTS, "WRITE_PRUNE_SEGMENTS"),
    ];

    /// Build from raw bits. Unknown bits are kept as-is.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bit pattern.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// A copy of `self` with the bits of `other` cleared.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Flags(NONE)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({})", names.join(" | "))
    }
}
