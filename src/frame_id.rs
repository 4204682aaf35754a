use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Producer-assigned frame identifier.
///
/// Frame ids increase monotonically and wrap around after `u32::MAX`.
///  Ordering is modular with a window of 2^31: an id counts as 'after'
///  another if fewer than 2^31 increments separate them going forward.
///  That relation is not a total order, so `FrameId` deliberately does not
///  implement `Ord` - use [`FrameId::seq_cmp`] or [`FrameId::is_after`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FrameId(u32);

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FrameId {
    pub const ZERO: FrameId = FrameId(0);

    pub fn from_raw(value: u32) -> Self {
        FrameId(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> FrameId {
        FrameId(self.0.wrapping_add(1))
    }

    /// Modular comparison: `Greater` if `self` is within 2^31 increments
    ///  ahead of `other`, `Less` if behind.
    pub fn seq_cmp(self, other: FrameId) -> Ordering {
        let diff = self.0.wrapping_sub(other.0);
        if diff == 0 {
            Ordering::Equal
        }
        else if diff < 1 << 31 {
            Ordering::Greater
        }
        else {
            Ordering::Less
        }
    }

    pub fn is_after(self, other: FrameId) -> bool {
        self.seq_cmp(other) == Ordering::Greater
    }

    /// Number of increments from `other` forward to `self`, modulo 2^32.
    ///  Meaningful only when `self` is at or after `other`.
    pub fn distance_from(self, other: FrameId) -> u32 {
        self.0.wrapping_sub(other.0)
    }
}
