//! Mapper records for file-backed pages.
//!
//! The real page cache lives in the VFS; this subsystem only tracks which
//! address spaces map each cached page so that clone can register a
//! secondary mapper and region free can detach its mappings again.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mmu::{PAddr, VAddr};
use crate::vm::region::{SpaceId, VnodeId};

#[derive(Debug)]
pub struct FilePage {
    pub paddr: PAddr,
    /// Every (space, vaddr) mapping of this cached page.
    pub mappers: Vec<(SpaceId, VAddr)>,
    /// Set while the page is a private pending-copy-on-write copy rather
    /// than the canonical cached page; such pages take no new mappers.
    pub cow_pending: bool,
}

pub struct FileCache {
    files: BTreeMap<VnodeId, BTreeMap<u64, FilePage>>,
}

impl FileCache {
    pub fn new() -> Self {
        FileCache { files: BTreeMap::new() }
    }

    /// Record a cached page for `(vnode, pgoff)`. Used by the fault-in
    /// path when a file page is first mapped.
    pub fn install(&mut self, vnode: VnodeId, pgoff: u64, paddr: PAddr) {
        self.files.entry(vnode).or_insert_with(BTreeMap::new).insert(
            pgoff,
            FilePage { paddr, mappers: Vec::new(), cow_pending: false },
        );
    }

    pub fn lookup(&self, vnode: VnodeId, pgoff: u64) -> Option<&FilePage> {
        self.files.get(&vnode)?.get(&pgoff)
    }

    /// Register `space` as a mapper of the cached page, unless the page
    /// is a pending COW copy. Returns whether a record was added.
    pub fn add_mapper(&mut self, vnode: VnodeId, pgoff: u64, space: SpaceId, vaddr: VAddr) -> bool {
        if let Some(page) = self.files.get_mut(&vnode).and_then(|f| f.get_mut(&pgoff)) {
            if page.cow_pending {
                return false;
            }
            page.mappers.push((space, vaddr));
            return true;
        }
        false
    }

    pub fn mark_cow_pending(&mut self, vnode: VnodeId, pgoff: u64) {
        if let Some(page) = self.files.get_mut(&vnode).and_then(|f| f.get_mut(&pgoff)) {
            page.cow_pending = true;
        }
    }

    /// Detach every mapping `space` holds on `vnode` within the page
    /// offset range `[start, end)`. Returns how many records went away.
    pub fn detach_range(&mut self, vnode: VnodeId, start: u64, end: u64, space: SpaceId) -> usize {
        let mut detached = 0;
        if let Some(pages) = self.files.get_mut(&vnode) {
            for (_, page) in pages.range_mut(start..end) {
                let before = page.mappers.len();
                page.mappers.retain(|&(s, _)| s != space);
                detached += before - page.mappers.len();
            }
        }
        detached
    }

    pub fn mapper_count(&self, vnode: VnodeId, pgoff: u64) -> usize {
        self.lookup(vnode, pgoff).map_or(0, |p| p.mappers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mappers_attach_and_detach_by_range() {
        let mut cache = FileCache::new();
        cache.install(7, 0, 0x10_0000);
        cache.install(7, 1, 0x10_1000);
        assert!(cache.add_mapper(7, 0, 1, 0x4000));
        assert!(cache.add_mapper(7, 1, 1, 0x5000));
        assert!(cache.add_mapper(7, 1, 2, 0x5000));
        assert_eq!(cache.detach_range(7, 0, 2, 1), 2);
        assert_eq!(cache.mapper_count(7, 1), 1);
    }

    #[test]
    fn pending_cow_page_takes_no_mappers() {
        let mut cache = FileCache::new();
        cache.install(7, 0, 0x10_0000);
        cache.mark_cow_pending(7, 0);
        assert!(!cache.add_mapper(7, 0, 1, 0x4000));
        assert_eq!(cache.mapper_count(7, 0), 0);
    }
}
