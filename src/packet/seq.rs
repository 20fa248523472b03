//! Wraparound-aware sequence numbers.

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub},
};

/// A 32-bit sequence number that wraps around [`u32::MAX`] back to `0`.
///
/// Comparisons and distances are computed modulo 2^32, treating the number
/// line as a circle: `Seq(0)` is considered to come after `Seq(u32::MAX)`.
/// This lets a connection run for 4 billion packets without its sequence
/// space overflowing incorrectly, as long as no two sequence numbers being
/// compared are ever more than `u32::MAX / 2` apart - see
/// [*Gaffer On Games*, sequence buffers](https://gafferongames.com/post/reliable_ordered_messages/).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u32);

impl Seq {
    /// Creates a sequence number from a raw value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Signed distance from `other` to `self`, interpreted with wraparound.
    ///
    /// A positive result means `self` comes after `other`; negative means
    /// before; zero means equal.
    ///
    /// ```
    /// use swarmlink::packet::Seq;
    /// assert_eq!(1, Seq::new(5).distance_from(Seq::new(4)));
    /// assert_eq!(-1, Seq::new(4).distance_from(Seq::new(5)));
    /// assert_eq!(1, Seq::new(0).distance_from(Seq::new(u32::MAX)));
    /// ```
    #[must_use]
    pub fn distance_from(self, other: Self) -> i64 {
        let diff = self.0.wrapping_sub(other.0);
        // interpret the unsigned wraparound diff as a signed offset
        i64::from(diff as i32)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_from(*other).cmp(&0)
    }
}

impl Add<u32> for Seq {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for Seq {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for Seq {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}
