use bytemuck::{Pod, Zeroable};

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use crate::util::constants::*;

/// A byte position in the logical store file. `Address` is designed to
/// represent store positions and do address arithmetic in a safe way: it is
/// zero overhead (a bare `u64`), stable across runs, and decomposes into a
/// (segment, offset) pair which the segment address table uses to locate the
/// mapped memory backing the position.
///
/// The all-zero address is reserved as the null sentinel: the file header
/// occupies offset zero, so no allocation is ever placed there.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, Pod, Zeroable)]
pub struct Address(u64);

/// The segment number portion of an `Address`.
pub type Segment = usize;

/// Address + byte count. Panics if the result leaves the addressable store:
/// that is a programmer error, not a recoverable condition.
impl Add<u64> for Address {
    type Output = Address;
    fn add(self, offset: u64) -> Address {
        Address::new(self.0 + offset)
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, offset: u64) {
        *self = *self + offset;
    }
}

/// Address - Address (the first address must be the higher one).
impl Sub<Address> for Address {
    type Output = u64;
    fn sub(self, other: Address) -> u64 {
        debug_assert!(
            self.0 >= other.0,
            "for (a - b), a ({}) must not be lower than b ({})",
            self,
            other
        );
        self.0 - other.0
    }
}

impl Address {
    /// The null sentinel.
    pub const NULL: Self = Address(0);
    /// The highest possible address plus one.
    pub const END: Self = Address(ADDRESS_SPACE_BYTES);

    /// Creates an `Address` from a raw byte position. Asserts that the
    /// position lies within the addressable store.
    pub const fn new(raw: u64) -> Address {
        assert!(raw <= ADDRESS_SPACE_BYTES, "address out of range");
        Address(raw)
    }

    /// Composes an `Address` from a segment number and a byte offset within
    /// that segment.
    pub const fn from_segment_and_offset(segment: Segment, offset: u64) -> Address {
        assert!(segment < SAT_ELEMENTS, "segment number out of range");
        assert!(offset < SEGMENT_BYTES, "segment offset out of range");
        Address(((segment as u64) << LOG_SEGMENT_BYTES) | offset)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The segment number containing this address.
    pub const fn segment(self) -> Segment {
        (self.0 >> LOG_SEGMENT_BYTES) as Segment
    }

    /// The byte offset of this address within its segment.
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    // The const forms are duplicated with the operator traits: we need them
    // to declare constants and to use in const contexts.

    /// Add a byte count to the address.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, size: u64) -> Address {
        Address::new(self.0 + size)
    }

    /// The number of bytes between two addresses. `self` must be the higher.
    pub const fn extent_from(self, other: Address) -> u64 {
        self.0 - other.0
    }

    pub const fn is_aligned_to(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Align the address up to a multiple of `align` (a power of two).
    pub const fn align_up(self, align: u64) -> Address {
        Address::new(crate::util::conversions::raw_align_up(self.0, align))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split() {
        let a = Address::new(3 * SEGMENT_BYTES + 17);
        assert_eq!(a.segment(), 3);
        assert_eq!(a.offset(), 17);
        assert_eq!(a, Address::from_segment_and_offset(3, 17));
    }

    #[test]
    fn null() {
        assert!(Address::NULL.is_null());
        assert!(!Address::new(8).is_null());
        assert_eq!(Address::NULL.segment(), 0);
        assert_eq!(Address::NULL.offset(), 0);
    }

    #[test]
    fn arithmetic() {
        let a = Address::new(SEGMENT_BYTES - 4);
        let b = a + 8u64;
        assert_eq!(b.segment(), 1);
        assert_eq!(b.offset(), 4);
        assert_eq!(b - a, 8);
    }

    #[test]
    #[should_panic]
    fn add_overflow() {
        let _ = Address::new(ADDRESS_SPACE_BYTES) + 1u64;
    }

    #[test]
    #[should_panic]
    fn compose_bad_offset() {
        let _ = Address::from_segment_and_offset(0, SEGMENT_BYTES);
    }

    #[test]
    fn alignment() {
        let a = Address::new(9);
        assert_eq!(a.align_up(8).as_u64(), 16);
        assert!(Address::new(16).is_aligned_to(8));
        assert!(!a.is_aligned_to(8));
    }
}
