//! Fixed-capacity cell bitmap used by the partial-update predicate.

use std::fmt;

use super::geometry::MAX_K;

/// Set of data-cell indices of one stripe, `len <= MAX_K`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CellSet {
    bits: u64,
    len: u32,
}

impl CellSet {
    /// Empty set over `len` cells.
    pub fn new(len: u32) -> Self {
        assert!(len as usize <= MAX_K, "cell set of {len} exceeds {MAX_K}");
        Self { bits: 0, len }
    }

    /// Number of cells the set ranges over.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn set(&mut self, cell: u32) {
        assert!(cell < self.len, "cell {cell} out of range {}", self.len);
        self.bits |= 1 << cell;
    }

    pub fn is_set(&self, cell: u32) -> bool {
        cell < self.len && self.bits & (1 << cell) != 0
    }

    /// Number of cells in the set.
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// True if every one of the `len` cells is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Cells not in the set, within `len`.
    pub fn complement(&self) -> Self {
        Self {
            bits: !self.bits & self.mask(),
            len: self.len,
        }
    }

    /// Set cells in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |c| self.is_set(*c))
    }

    fn mask(&self) -> u64 {
        if self.len as usize == MAX_K {
            u64::MAX
        } else {
            (1u64 << self.len) - 1
        }
    }
}

impl fmt::Debug for CellSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellSet[")?;
        for c in 0..self.len {
            write!(f, "{}", if self.is_set(c) { '1' } else { '0' })?;
        }
        write!(f, "]")
    }
}
