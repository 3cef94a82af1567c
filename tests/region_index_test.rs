//! Property coverage for the end-address-keyed region index.

use proptest::prelude::*;
use structshaper_core::{MemoryRegion, RegionIndex};

#[test]
fn exact_boundaries() {
    let index = RegionIndex::from_regions([MemoryRegion::new(0x1000, 0x1000)]);

    assert_eq!(
        index.region_from_address(0x1000),
        Some(MemoryRegion::new(0x1000, 0x1000))
    );
    assert!(index.region_from_address(0x1FFF).is_some());
    // One past the end belongs to nothing.
    assert_eq!(index.region_from_address(0x2000), None);
    assert_eq!(index.region_from_address(0x0FFF), None);
}

#[test]
fn adjacent_regions_resolve_to_their_own_side() {
    let index = RegionIndex::from_regions([
        MemoryRegion::new(0x1000, 0x1000),
        MemoryRegion::new(0x2000, 0x1000),
    ]);

    assert_eq!(index.region_from_address(0x1FFF).map(|r| r.address), Some(0x1000));
    assert_eq!(index.region_from_address(0x2000).map(|r| r.address), Some(0x2000));
    assert_eq!(index.region_from_address(0x2FFF).map(|r| r.address), Some(0x2000));
    assert_eq!(index.region_from_address(0x3000), None);
}

/// Non-overlapping regions with gaps in between.
fn disjoint_regions() -> impl Strategy<Value = Vec<MemoryRegion>> {
    prop::collection::vec((1u64..0x1000, 1u64..0x1000), 0..16).prop_map(|pairs| {
        let mut cursor = 0x10000u64;
        let mut regions = Vec::new();
        for (gap, size) in pairs {
            cursor += gap;
            regions.push(MemoryRegion::new(cursor, size));
            cursor += size;
        }
        regions
    })
}

proptest! {
    #[test]
    fn lookup_agrees_with_linear_scan(
        regions in disjoint_regions(),
        probes in prop::collection::vec(0x10000u64..0x40000, 32),
    ) {
        let index = RegionIndex::from_regions(regions.clone());
        for address in probes {
            let expected = regions.iter().copied().find(|r| r.contains(address));
            prop_assert_eq!(index.region_from_address(address), expected);
        }
    }

    #[test]
    fn every_inserted_byte_resolves(regions in disjoint_regions()) {
        let index = RegionIndex::from_regions(regions.clone());
        for region in &regions {
            // Probe first, last, and one-past-last byte of each region.
            prop_assert_eq!(index.region_from_address(region.address), Some(*region));
            prop_assert_eq!(
                index.region_from_address(region.end_address() - 1),
                Some(*region)
            );
            let past_end = index.region_from_address(region.end_address());
            prop_assert!(past_end.is_none() || past_end.unwrap().address == region.end_address());
        }
    }
}
