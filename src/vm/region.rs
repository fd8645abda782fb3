//! Virtual memory regions.

use bitflags::bitflags;

use crate::mmu::{MapFlags, PAGE_SHIFT, VAddr};

/// Identifier the global space registry hands out.
pub type SpaceId = u32;

/// Identifier of a file's in-memory vnode, owned by the VFS.
pub type VnodeId = u32;

bitflags! {
    /// Region permission and lifecycle bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ            = 1 << 0;
        const WRITE           = 1 << 1;
        const EXECUTE         = 1 << 2;
        const USER            = 1 << 3;
        /// Map exactly at the requested address, unmapping anything in the way.
        const FIXED           = 1 << 4;
        /// Map exactly at the requested address, failing if anything is there.
        const FIXED_NOREPLACE = 1 << 5;
        /// The region backs a thread stack.
        const STACK           = 1 << 6;
        /// The region is the process heap.
        const HEAP            = 1 << 7;
    }
}

/// What provides the pages of a region, and how they are released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionBacking {
    /// Demand-zero pages owned by this mapping.
    Anon,
    /// Device memory; the region never owns the pages.
    Device,
    /// Pages shared with the file page cache.
    File {
        vnode: VnodeId,
        /// Page offset of the region's first page within the file.
        pgoff: u64,
        open_flags: u32,
    },
    /// A shared-memory segment; the shm subsystem owns the pages.
    Shm { segment: u32 },
}

/// One contiguous mapped interval of an address space.
#[derive(Debug, Clone)]
pub struct VmRegion {
    pub base: VAddr,
    pub size: usize,
    pub flags: RegionFlags,
    pub backing: RegionBacking,
    /// The owning space, resolved through the space registry.
    pub space: SpaceId,
}

impl VmRegion {
    pub fn end(&self) -> VAddr {
        self.base + self.size
    }

    pub fn page_count(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    pub fn contains(&self, addr: VAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Interval overlap, inclusive of both endpoints of the probe.
    pub fn overlaps(&self, base: VAddr, size: usize) -> bool {
        base < self.end() && self.base < base + size
    }

    /// MMU permission bits derived from the region flags.
    pub fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.flags.contains(RegionFlags::READ) {
            flags |= MapFlags::READ;
        }
        if self.flags.contains(RegionFlags::WRITE) {
            flags |= MapFlags::WRITE;
        }
        if self.flags.contains(RegionFlags::EXECUTE) {
            flags |= MapFlags::EXECUTE;
        }
        if self.flags.contains(RegionFlags::USER) {
            flags |= MapFlags::USER;
        }
        flags
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, RegionBacking::File { .. })
    }
}
