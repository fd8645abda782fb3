//! Architecture MMU boundary.
//!
//! The page-table format and TLB handling live outside this subsystem; the
//! VM layer only ever talks to an [`ArchMmu`]. [`SoftMmu`] is the software
//! rendition used by tests and hostable builds: a sorted map standing in
//! for a translation-table hierarchy.

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KResult, KernError};

pub type VAddr = usize;
pub type PAddr = usize;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Round `len` up to a whole number of pages.
pub fn page_round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

bitflags! {
    /// Per-page mapping permissions handed to the MMU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER    = 1 << 3;
    }
}

/// The translation-table base of the most recently activated context.
static ACTIVE_TTB: AtomicUsize = AtomicUsize::new(0);

/// Architecture-specific page-table management, consumed abstractly.
pub trait ArchMmu: Send {
    /// Map `count` pages starting at `vaddr` to physical pages starting at
    /// `paddr`. Returns how many pages were actually mapped.
    fn map(&mut self, vaddr: VAddr, paddr: PAddr, count: usize, flags: MapFlags) -> KResult<usize>;

    /// Unmap up to `count` pages; returns how many mappings were removed.
    fn unmap(&mut self, vaddr: VAddr, count: usize) -> usize;

    /// Translate one virtual page to its physical page and flags.
    fn query(&self, vaddr: VAddr) -> Option<(PAddr, MapFlags)>;

    /// Rewrite the protection bits of up to `count` mapped pages; returns
    /// how many entries were changed.
    fn change_protection(&mut self, vaddr: VAddr, count: usize, flags: MapFlags) -> usize;

    /// Move a run of mappings to a new virtual base, keeping the physical
    /// pages and applying `flags`.
    fn move_mapping(&mut self, old: VAddr, new: VAddr, count: usize, flags: MapFlags) -> KResult<()>;

    /// Make this context the active one.
    fn context_switch(&mut self);

    /// Tear the context down; the instance must not be used afterwards.
    fn destroy(&mut self);

    /// Root of the translation-table hierarchy.
    fn ttb(&self) -> PAddr;
}

/// Software page table: one entry per mapped page, keyed by page-aligned
/// virtual address.
pub struct SoftMmu {
    ttb: PAddr,
    entries: BTreeMap<VAddr, (PAddr, MapFlags)>,
    dead: bool,
}

impl SoftMmu {
    pub fn new(ttb: PAddr) -> Self {
        SoftMmu { ttb, entries: BTreeMap::new(), dead: false }
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.len()
    }
}

impl ArchMmu for SoftMmu {
    fn map(&mut self, vaddr: VAddr, paddr: PAddr, count: usize, flags: MapFlags) -> KResult<usize> {
        if self.dead || !page_aligned(vaddr) || !page_aligned(paddr) {
            return Err(KernError::InvalidArg);
        }
        let mut done = 0;
        for i in 0..count {
            let va = vaddr + i * PAGE_SIZE;
            if self.entries.contains_key(&va) {
                // The region layer never double-maps; stop rather than
                // silently replace a live translation.
                break;
            }
            self.entries.insert(va, (paddr + i * PAGE_SIZE, flags));
            done += 1;
        }
        Ok(done)
    }

    fn unmap(&mut self, vaddr: VAddr, count: usize) -> usize {
        let mut done = 0;
        for i in 0..count {
            if self.entries.remove(&(vaddr + i * PAGE_SIZE)).is_some() {
                done += 1;
            }
        }
        done
    }

    fn query(&self, vaddr: VAddr) -> Option<(PAddr, MapFlags)> {
        self.entries.get(&(vaddr & !(PAGE_SIZE - 1))).copied()
    }

    fn change_protection(&mut self, vaddr: VAddr, count: usize, flags: MapFlags) -> usize {
        let mut done = 0;
        for i in 0..count {
            if let Some(entry) = self.entries.get_mut(&(vaddr + i * PAGE_SIZE)) {
                entry.1 = flags;
                done += 1;
            }
        }
        done
    }

    fn move_mapping(&mut self, old: VAddr, new: VAddr, count: usize, flags: MapFlags) -> KResult<()> {
        for i in 0..count {
            let va = old + i * PAGE_SIZE;
            if let Some((paddr, _)) = self.entries.remove(&va) {
                let target = new + i * PAGE_SIZE;
                if self.entries.contains_key(&target) {
                    return Err(KernError::Busy);
                }
                self.entries.insert(target, (paddr, flags));
            }
        }
        Ok(())
    }

    fn context_switch(&mut self) {
        ACTIVE_TTB.store(self.ttb, Ordering::SeqCst);
    }

    fn destroy(&mut self) {
        self.entries.clear();
        self.dead = true;
    }

    fn ttb(&self) -> PAddr {
        self.ttb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_query_unmap_roundtrip() {
        let mut mmu = SoftMmu::new(0x1000);
        let flags = MapFlags::READ | MapFlags::WRITE;
        assert_eq!(mmu.map(0x4000, 0x8000, 2, flags), Ok(2));
        assert_eq!(mmu.query(0x5000), Some((0x9000, flags)));
        assert_eq!(mmu.query(0x5fff), Some((0x9000, flags)));
        assert_eq!(mmu.unmap(0x4000, 2), 2);
        assert_eq!(mmu.query(0x4000), None);
    }

    #[test]
    fn map_stops_at_existing_entry() {
        let mut mmu = SoftMmu::new(0x1000);
        mmu.map(0x5000, 0x9000, 1, MapFlags::READ).unwrap();
        // Second page of the run collides, only the first is mapped.
        assert_eq!(mmu.map(0x4000, 0x8000, 3, MapFlags::READ), Ok(1));
    }

    #[test]
    fn change_protection_rewrites_flags() {
        let mut mmu = SoftMmu::new(0);
        mmu.map(0x4000, 0x8000, 1, MapFlags::READ | MapFlags::WRITE).unwrap();
        assert_eq!(mmu.change_protection(0x4000, 1, MapFlags::READ), 1);
        assert_eq!(mmu.query(0x4000), Some((0x8000, MapFlags::READ)));
    }

    #[test]
    fn destroyed_context_rejects_map() {
        let mut mmu = SoftMmu::new(0);
        mmu.destroy();
        assert_eq!(mmu.map(0x4000, 0x8000, 1, MapFlags::READ), Err(KernError::InvalidArg));
    }
}
