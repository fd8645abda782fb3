//! Region tree of one address space.
//!
//! A balanced map keyed by region base address. Two ranges compare equal
//! for lookup purposes whenever they overlap, so a one-byte probe finds
//! the region containing it. The tree owns its regions; insertion of an
//! overlapping range is refused and the caller rolls back.

use alloc::collections::BTreeMap;

use crate::error::{KResult, KernError};
use crate::mmu::VAddr;
use crate::vm::region::VmRegion;

pub struct RegionTree {
    map: BTreeMap<VAddr, VmRegion>,
}

impl RegionTree {
    pub fn new() -> Self {
        RegionTree { map: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a region, failing with `Busy` if any existing region
    /// overlaps its interval.
    pub fn insert(&mut self, region: VmRegion) -> KResult<()> {
        if self.find_range(region.base, region.size).is_some() {
            return Err(KernError::Busy);
        }
        self.map.insert(region.base, region);
        Ok(())
    }

    /// The region containing `addr`, if any.
    pub fn find(&self, addr: VAddr) -> Option<&VmRegion> {
        self.find_range(addr, 1)
    }

    /// The first region overlapping `[addr, addr + len)`, if any.
    pub fn find_range(&self, addr: VAddr, len: usize) -> Option<&VmRegion> {
        // Candidate 1: the nearest region at or below addr.
        if let Some((_, region)) = self.map.range(..=addr).next_back() {
            if region.overlaps(addr, len) {
                return Some(region);
            }
        }
        // Candidate 2: the first region starting inside the probe.
        if let Some((_, region)) = self.map.range(addr + 1..addr + len.max(1)).next() {
            if region.overlaps(addr, len) {
                return Some(region);
            }
        }
        None
    }

    pub fn find_mut(&mut self, addr: VAddr) -> Option<&mut VmRegion> {
        let base = self.find(addr)?.base;
        self.map.get_mut(&base)
    }

    /// Exact lookup by base address.
    pub fn get(&self, base: VAddr) -> Option<&VmRegion> {
        self.map.get(&base)
    }

    /// Remove the region with this base address. The caller must have
    /// released its pages already.
    pub fn remove(&mut self, base: VAddr) -> Option<VmRegion> {
        self.map.remove(&base)
    }

    /// The region with the next-higher base address.
    pub fn successor(&self, base: VAddr) -> Option<&VmRegion> {
        self.map.range(base + 1..).next().map(|(_, r)| r)
    }

    /// Regions in ascending base order.
    pub fn iter(&self) -> impl Iterator<Item = &VmRegion> {
        self.map.values()
    }

    /// Base addresses in ascending order, for callers that mutate while
    /// walking.
    pub fn bases(&self) -> impl Iterator<Item = VAddr> + '_ {
        self.map.keys().copied()
    }

    /// First-fit gap search: the lowest address `a >= map_base` such that
    /// `[a, a + len)` fits strictly between existing regions and below
    /// `map_limit`. Deterministic under no intervening mutation.
    pub fn alloc_gap(&self, map_base: VAddr, map_limit: VAddr, len: usize) -> Option<VAddr> {
        if len == 0 || map_base + len > map_limit {
            return None;
        }
        let mut candidate = map_base;
        for region in self.map.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.base >= candidate + len {
                break;
            }
            candidate = region.end();
        }
        if candidate + len <= map_limit {
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::region::{RegionBacking, RegionFlags};

    fn region(base: VAddr, size: usize) -> VmRegion {
        VmRegion {
            base,
            size,
            flags: RegionFlags::READ | RegionFlags::WRITE,
            backing: RegionBacking::Anon,
            space: 0,
        }
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x2000)).unwrap();
        assert_eq!(tree.insert(region(0x2000, 0x1000)), Err(KernError::Busy));
        assert_eq!(tree.insert(region(0x0000, 0x1001)), Err(KernError::Busy));
        // Merely touching ranges are fine.
        tree.insert(region(0x3000, 0x1000)).unwrap();
        tree.insert(region(0x0000, 0x1000)).unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn one_byte_probe_finds_container() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x2000)).unwrap();
        assert_eq!(tree.find(0x1000).unwrap().base, 0x1000);
        assert_eq!(tree.find(0x2fff).unwrap().base, 0x1000);
        assert!(tree.find(0x3000).is_none());
        assert!(tree.find(0xfff).is_none());
    }

    #[test]
    fn range_probe_spanning_gap_finds_next_region() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x5000, 0x1000)).unwrap();
        // Probe starts in the gap before the region but reaches into it.
        assert_eq!(tree.find_range(0x4800, 0x1000).unwrap().base, 0x5000);
        assert!(tree.find_range(0x4000, 0x1000).is_none());
    }

    #[test]
    fn successor_walks_in_address_order() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x5000, 0x1000)).unwrap();
        tree.insert(region(0x1000, 0x1000)).unwrap();
        tree.insert(region(0x3000, 0x1000)).unwrap();
        assert_eq!(tree.successor(0x1000).unwrap().base, 0x3000);
        assert_eq!(tree.successor(0x3000).unwrap().base, 0x5000);
        assert!(tree.successor(0x5000).is_none());
    }

    #[test]
    fn gap_search_is_first_fit_and_idempotent() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x1000)).unwrap();
        tree.insert(region(0x4000, 0x1000)).unwrap();
        let first = tree.alloc_gap(0x1000, 0x10000, 0x2000).unwrap();
        assert_eq!(first, 0x2000);
        // No mutation in between: same answer.
        assert_eq!(tree.alloc_gap(0x1000, 0x10000, 0x2000), Some(first));
        // A gap too small is skipped in favor of the tail.
        assert_eq!(tree.alloc_gap(0x1000, 0x10000, 0x3000), Some(0x5000));
        // Nothing fits above the limit.
        assert_eq!(tree.alloc_gap(0x1000, 0x6000, 0x3000), None);
    }
}
