// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`MemoryRange`] type, a page-aligned byte range of guest-physical
//! memory.

use core::ops::Range;
use loader_defs::PAGE_SIZE;

/// Represents a page-aligned byte range of guest-physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryRange {
    start: u64,
    end: u64,
}

impl core::fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start(), self.end())
    }
}

impl MemoryRange {
    /// Returns a new range for the given guest address range.
    ///
    /// Panics if the start or end are not page aligned or if the start is
    /// after the end.
    #[track_caller]
    pub const fn new(range: Range<u64>) -> Self {
        assert!(range.start & (PAGE_SIZE - 1) == 0);
        assert!(range.end & (PAGE_SIZE - 1) == 0);
        assert!(range.start <= range.end);
        Self {
            start: range.start,
            end: range.end,
        }
    }

    /// The first address in the range.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// The first address after the range.
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// The length of the range, in bytes.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range is empty.
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `self` and `other` share at least one byte.
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `addr` falls within the range.
    pub const fn contains_addr(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRange;

    #[test]
    fn test_overlaps() {
        let a = MemoryRange::new(0x1000..0x3000);
        let b = MemoryRange::new(0x2000..0x4000);
        let c = MemoryRange::new(0x3000..0x5000);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_contains() {
        let r = MemoryRange::new(0x1000..0x2000);
        assert!(r.contains_addr(0x1000));
        assert!(r.contains_addr(0x1fff));
        assert!(!r.contains_addr(0x2000));
        assert_eq!(r.len(), 0x1000);
    }

    #[test]
    #[should_panic]
    fn test_unaligned() {
        let _ = MemoryRange::new(0x1000..0x2001);
    }
}
