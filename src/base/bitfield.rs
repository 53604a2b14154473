//! Occupancy bitmaps for the small bins and the tree bins.
//!
//! Bit `i` is set if and only if bin `i` holds at least one free chunk.

use core::fmt::Debug;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BinMap(u32);

impl Debug for BinMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#034b}", self.0)
    }
}

impl BinMap {
    pub const EMPTY: Self = Self(0);

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn set_bit(&mut self, b: u32) {
        self.0 |= 1 << b;
    }

    #[inline(always)]
    pub fn clear_bit(&mut self, b: u32) {
        self.0 &= !(1 << b);
    }

    #[inline(always)]
    pub fn read_bit(self, b: u32) -> bool {
        self.0 & 1 << b != 0
    }

    /// The bits at index `b` and above, shifted down to start at zero.
    #[inline(always)]
    pub fn from_bit(self, b: u32) -> u32 {
        self.0 >> b
    }

    /// Lowest set bit strictly above index `b`.
    #[inline(always)]
    pub fn bit_scan_above(self, b: u32) -> Option<u32> {
        let bits = self.0 & left_bits(1 << b);
        if bits == 0 { None } else { Some(bits.trailing_zeros()) }
    }

    #[inline(always)]
    pub fn lowest(self) -> Option<u32> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros()) }
    }
}

/// Mask of all bits strictly above the single set bit of `x`.
#[inline(always)]
const fn left_bits(x: u32) -> u32 {
    (x << 1) | (x << 1).wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans() {
        let mut map = BinMap::EMPTY;
        assert!(map.is_empty());
        assert_eq!(map.lowest(), None);

        map.set_bit(3);
        map.set_bit(17);
        map.set_bit(31);

        assert!(map.read_bit(17));
        assert!(!map.read_bit(16));
        assert_eq!(map.lowest(), Some(3));
        assert_eq!(map.bit_scan_above(3), Some(17));
        assert_eq!(map.bit_scan_above(17), Some(31));
        assert_eq!(map.bit_scan_above(31), None);
        assert_eq!(map.from_bit(17) & 1, 1);

        map.clear_bit(17);
        map.clear_bit(17);
        assert_eq!(map.bit_scan_above(3), Some(31));
    }

    #[test]
    fn left_bit_masks() {
        assert_eq!(left_bits(1), !1);
        assert_eq!(left_bits(1 << 4), !0x1F);
        assert_eq!(left_bits(1 << 31), 0);
    }
}
