//! Committed memory regions and the end-address-keyed region index

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// A committed virtual memory region of the target process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn new(address: u64, size: u64) -> Self {
        MemoryRegion { address, size }
    }

    /// End address (one past the last byte of the region)
    pub fn end_address(&self) -> u64 {
        self.address + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end_address()
    }
}

/// Interval-membership index over non-overlapping regions, keyed by end
/// address. Lookup finds the smallest end strictly greater than the queried
/// address and then checks the region start, giving O(log n) containment
/// queries with no false positives at either boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionIndex {
    regions: BTreeMap<u64, MemoryRegion>,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regions(regions: impl IntoIterator<Item = MemoryRegion>) -> Self {
        let mut index = Self::new();
        for region in regions {
            index.insert(region);
        }
        index
    }

    pub fn insert(&mut self, region: MemoryRegion) {
        if region.size == 0 {
            return;
        }
        self.regions.insert(region.end_address(), region);
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the region containing `address`, if any.
    pub fn region_from_address(&self, address: u64) -> Option<MemoryRegion> {
        let (_, region) = self
            .regions
            .range((Excluded(address), Unbounded))
            .next()?;
        region.contains(address).then_some(*region)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_at_boundaries() {
        let index = RegionIndex::from_regions([
            MemoryRegion::new(0x1000, 0x1000),
            MemoryRegion::new(0x3000, 0x800),
        ]);

        // Exact start is inside
        assert_eq!(
            index.region_from_address(0x1000),
            Some(MemoryRegion::new(0x1000, 0x1000))
        );
        // Last byte is inside
        assert!(index.region_from_address(0x1FFF).is_some());
        // Exact end is outside: no false positive across the boundary
        assert!(index.region_from_address(0x2000).is_none());
        // Gap between the regions
        assert!(index.region_from_address(0x2FFF).is_none());
        assert!(index.region_from_address(0x3000).is_some());
        assert!(index.region_from_address(0x37FF).is_some());
        assert!(index.region_from_address(0x3800).is_none());
    }

    #[test]
    fn below_and_above_all_regions() {
        let index = RegionIndex::from_regions([MemoryRegion::new(0x1000, 0x1000)]);
        assert!(index.region_from_address(0).is_none());
        assert!(index.region_from_address(0xFFF).is_none());
        assert!(index.region_from_address(u64::MAX).is_none());
    }

    #[test]
    fn zero_sized_regions_are_ignored() {
        let mut index = RegionIndex::new();
        index.insert(MemoryRegion::new(0x1000, 0));
        assert!(index.is_empty());
    }
}
