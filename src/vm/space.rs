//! Virtual address spaces.
//!
//! A space owns a region tree, an MMU context and (for user spaces) heap
//! bounds and an mmap search base. The tree and MMU are guarded by the
//! space's own blocking mutex, never by the scheduler lock: region work
//! can itself block on page allocation. Lock order within the VM layer is
//! region mutex first, then the physical pool or file cache.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KResult, KernError};
use crate::mmu::{
    ArchMmu, MapFlags, PAGE_SHIFT, PAGE_SIZE, PAddr, SoftMmu, VAddr, page_aligned, page_round_up,
};
use crate::phys::PhysPool;
use crate::vm::filecache::FileCache;
use crate::vm::region::{RegionBacking, RegionFlags, SpaceId, VmRegion};
use crate::vm::tree::RegionTree;

/// Kernel image and direct-map window.
pub const KERNEL_ASPACE_BASE: VAddr = 0x4000_0000;
pub const KERNEL_ASPACE_SIZE: usize = 0x4000_0000;

/// Dynamically sized kernel allocations live in their own space.
pub const VMALLOC_BASE: VAddr = 0x8000_0000;
pub const VMALLOC_SIZE: usize = 0x2000_0000;

pub const USER_ASPACE_BASE: VAddr = 0x0100_0000;
pub const USER_ASPACE_SIZE: usize = 0x3F00_0000;
pub const USER_HEAP_BASE: VAddr = USER_ASPACE_BASE + 0x0040_0000;
pub const USER_MAP_BASE: VAddr = USER_ASPACE_BASE + USER_ASPACE_SIZE / 2;
pub const USER_MAP_SIZE: usize = USER_ASPACE_SIZE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    VMalloc,
    User,
}

/// Shared memory environment: one physical pool and one file cache per
/// kernel instance, handed to every space as an `Arc`.
pub struct MemoryEnv {
    pub phys: Mutex<PhysPool>,
    pub cache: Mutex<FileCache>,
}

impl MemoryEnv {
    pub fn new(phys_base: PAddr, frames: usize) -> Arc<Self> {
        Arc::new(MemoryEnv {
            phys: Mutex::new(PhysPool::new(phys_base, frames)),
            cache: Mutex::new(FileCache::new()),
        })
    }
}

static NEXT_SPACE_ID: AtomicU32 = AtomicU32::new(1);

lazy_static! {
    /// Every live space, for diagnostics (`ps`-style dumps).
    static ref SPACE_REGISTRY: Mutex<Vec<(SpaceId, SpaceKind)>> = Mutex::new(Vec::new());
}

/// Ids of all registered spaces.
pub fn live_spaces() -> Vec<SpaceId> {
    SPACE_REGISTRY.lock().iter().map(|&(id, _)| id).collect()
}

struct VmInner {
    tree: RegionTree,
    mmu: Box<dyn ArchMmu>,
    map_base: VAddr,
    map_size: usize,
    heap_base: VAddr,
    heap_now: VAddr,
    /// Base of the region currently backing the heap, if any.
    heap_region: Option<VAddr>,
    /// Physical pages holding this space's translation tables.
    pt_pages: Vec<PAddr>,
    dead: bool,
}

pub struct VmSpace {
    pub id: SpaceId,
    pub kind: SpaceKind,
    pub base: VAddr,
    pub size: usize,
    env: Arc<MemoryEnv>,
    inner: Mutex<VmInner>,
}

impl VmSpace {
    /// Bring up a space of the given flavor around an existing MMU
    /// context and register it globally.
    pub fn init(kind: SpaceKind, env: Arc<MemoryEnv>, mmu: Box<dyn ArchMmu>) -> Arc<Self> {
        let (base, size, map_base, map_size, heap_base) = match kind {
            SpaceKind::Kernel => (
                KERNEL_ASPACE_BASE,
                KERNEL_ASPACE_SIZE,
                KERNEL_ASPACE_BASE,
                KERNEL_ASPACE_SIZE,
                0,
            ),
            SpaceKind::VMalloc => (VMALLOC_BASE, VMALLOC_SIZE, VMALLOC_BASE, VMALLOC_SIZE, 0),
            SpaceKind::User => (
                USER_ASPACE_BASE,
                USER_ASPACE_SIZE,
                USER_MAP_BASE,
                USER_MAP_SIZE,
                USER_HEAP_BASE,
            ),
        };
        let id = NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst);
        SPACE_REGISTRY.lock().push((id, kind));
        Arc::new(VmSpace {
            id,
            kind,
            base,
            size,
            env,
            inner: Mutex::new(VmInner {
                tree: RegionTree::new(),
                mmu,
                map_base,
                map_size,
                heap_base,
                heap_now: heap_base,
                heap_region: None,
                pt_pages: Vec::new(),
                dead: false,
            }),
        })
    }

    /// Create a fresh user space: allocate and zero one page for the
    /// translation table and remember it for teardown.
    pub fn create_user(env: Arc<MemoryEnv>) -> KResult<Arc<Self>> {
        let ttb = env.phys.lock().alloc()?;
        let space = VmSpace::init(SpaceKind::User, env, Box::new(SoftMmu::new(ttb)));
        space.inner.lock().pt_pages.push(ttb);
        Ok(space)
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    pub fn contains_range(&self, addr: VAddr, len: usize) -> bool {
        addr >= self.base && addr + len <= self.base + self.size
    }

    pub fn ttb(&self) -> PAddr {
        self.inner.lock().mmu.ttb()
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().tree.len()
    }

    /// Snapshot of the region containing `addr`.
    pub fn region_at(&self, addr: VAddr) -> Option<VmRegion> {
        self.inner.lock().tree.find(addr).cloned()
    }

    /// Translate one page through this space's MMU context.
    pub fn query(&self, vaddr: VAddr) -> Option<(PAddr, MapFlags)> {
        self.inner.lock().mmu.query(vaddr)
    }

    /// Heap bounds: (base, current frontier).
    pub fn heap_info(&self) -> (VAddr, VAddr) {
        let inner = self.inner.lock();
        (inner.heap_base, inner.heap_now)
    }

    /// Make this space's translation table the active one.
    pub fn context_switch(&self) {
        self.inner.lock().mmu.context_switch();
    }

    // ── Region lifecycle ────────────────────────────────────────────────

    /// Allocate a region at `vaddr` (0 = anywhere). FIXED unmaps whatever
    /// is in the way, FIXED_NOREPLACE fails busy instead, and an unfixed
    /// request for a busy address falls back to the gap search. No pages
    /// are mapped. Returns the chosen base.
    pub fn region_alloc(
        &self,
        vaddr: VAddr,
        len: usize,
        flags: RegionFlags,
        backing: RegionBacking,
    ) -> KResult<VAddr> {
        if len == 0 {
            return Err(KernError::InvalidArg);
        }
        if vaddr != 0 && !page_aligned(vaddr) {
            return Err(KernError::InvalidArg);
        }
        let len = page_round_up(len);

        let mut inner = self.inner.lock();
        if inner.dead {
            return Err(KernError::InvalidArg);
        }
        let base = if vaddr == 0 {
            self.alloc_gap_locked(&inner, len)?
        } else {
            if !self.contains_range(vaddr, len) {
                return Err(KernError::InvalidArg);
            }
            let occupied = inner.tree.find_range(vaddr, len).is_some();
            if occupied && flags.contains(RegionFlags::FIXED_NOREPLACE) {
                return Err(KernError::Busy);
            }
            if occupied && flags.contains(RegionFlags::FIXED) {
                self.remove_range_locked(&mut inner, vaddr, len)?;
                vaddr
            } else if occupied {
                // Neither fixed flag: quietly fall back to a gap search.
                self.alloc_gap_locked(&inner, len)?
            } else {
                vaddr
            }
        };

        let region = VmRegion { base, size: len, flags, backing, space: self.id };
        inner.tree.insert(region)?;
        if flags.contains(RegionFlags::HEAP) {
            inner.heap_region = Some(base);
        }
        Ok(base)
    }

    fn alloc_gap_locked(&self, inner: &VmInner, len: usize) -> KResult<VAddr> {
        inner
            .tree
            .alloc_gap(inner.map_base, inner.map_base + inner.map_size, len)
            .ok_or(KernError::NoMemory)
    }

    /// Free the region with this base address, releasing every resident
    /// page by the strategy its backing type demands.
    pub fn region_free(&self, base: VAddr) -> KResult<()> {
        let mut inner = self.inner.lock();
        let region = match inner.tree.get(base) {
            Some(r) => r.clone(),
            None => return Err(KernError::InvalidArg),
        };
        self.release_region_pages(&mut inner, &region);
        inner.tree.remove(base);
        if inner.heap_region == Some(base) {
            inner.heap_region = None;
        }
        Ok(())
    }

    /// Page release keyed by backing type. Anonymous and file pages drop
    /// one reference (reclaimed at zero); device and shared-memory pages
    /// are never owned here, only unmapped.
    fn release_region_pages(&self, inner: &mut VmInner, region: &VmRegion) {
        for i in 0..region.page_count() {
            let va = region.base + i * PAGE_SIZE;
            if let Some((pa, _)) = inner.mmu.query(va) {
                inner.mmu.unmap(va, 1);
                match region.backing {
                    RegionBacking::Anon | RegionBacking::File { .. } => {
                        let _ = self.env.phys.lock().dec_ref(pa);
                    }
                    RegionBacking::Device | RegionBacking::Shm { .. } => {}
                }
            }
        }
        if let RegionBacking::File { vnode, pgoff, .. } = region.backing {
            let pages = region.page_count() as u64;
            self.env
                .cache
                .lock()
                .detach_range(vnode, pgoff, pgoff + pages, self.id);
        }
    }

    /// Split the region containing `cut` into `[base, cut)` and
    /// `[cut, end)`. A cut on a region boundary is a no-op, so both
    /// halves come out nonempty.
    fn split_locked(&self, inner: &mut VmInner, cut: VAddr) -> KResult<()> {
        if !page_aligned(cut) {
            return Err(KernError::InvalidArg);
        }
        let region = match inner.tree.find(cut) {
            Some(r) => r.clone(),
            None => return Err(KernError::InvalidArg),
        };
        if cut <= region.base || cut >= region.end() {
            return Ok(());
        }
        inner.tree.remove(region.base);

        let moved_pages = ((cut - region.base) >> PAGE_SHIFT) as u64;
        let mut high = region.clone();
        high.base = cut;
        high.size = region.end() - cut;
        if let RegionBacking::File { ref mut pgoff, .. } = high.backing {
            *pgoff += moved_pages;
        }

        let mut low = region;
        low.size = cut - low.base;
        inner.tree.insert(low)?;
        inner.tree.insert(high)?;
        Ok(())
    }

    /// Make both `start` and `start + len` region boundaries, splitting
    /// whichever regions they fall strictly inside of.
    fn adjust_for_range_locked(&self, inner: &mut VmInner, start: VAddr, len: usize) -> KResult<()> {
        self.split_locked(inner, start)?;
        self.split_locked(inner, start + len)?;
        Ok(())
    }

    /// Unmap `[start, start + len)`: split at the boundaries, then free
    /// every region now fully contained in the range.
    pub fn remove_range(&self, start: VAddr, len: usize) -> KResult<()> {
        if !page_aligned(start) || len == 0 {
            return Err(KernError::InvalidArg);
        }
        let len = page_round_up(len);
        let mut inner = self.inner.lock();
        self.remove_range_locked(&mut inner, start, len)
    }

    fn remove_range_locked(&self, inner: &mut VmInner, start: VAddr, len: usize) -> KResult<()> {
        self.adjust_for_range_locked(inner, start, len)?;
        let end = start + len;
        let doomed: Vec<VAddr> = inner
            .tree
            .bases()
            .filter(|&b| b >= start && b < end)
            .collect();
        for base in doomed {
            let region = match inner.tree.get(base) {
                Some(r) if r.end() <= end => r.clone(),
                _ => continue,
            };
            self.release_region_pages(inner, &region);
            inner.tree.remove(base);
            if inner.heap_region == Some(base) {
                inner.heap_region = None;
            }
        }
        Ok(())
    }

    /// Duplicate a region's flags and backing metadata at a new address
    /// (0 = anywhere) within this space. Pages are not copied.
    pub fn region_dup(&self, src_base: VAddr, at: VAddr) -> KResult<VAddr> {
        let backing;
        let flags;
        let len;
        {
            let inner = self.inner.lock();
            let src = inner.tree.get(src_base).ok_or(KernError::InvalidArg)?;
            backing = src.backing.clone();
            flags = src.flags;
            len = src.size;
        }
        self.region_alloc(at, len, flags, backing)
    }

    // ── Fault-in and direct mapping ─────────────────────────────────────

    /// Materialize one page of the region containing `vaddr`.
    ///
    /// Anonymous regions take ownership of the caller's freshly allocated
    /// page (its initial reference becomes the mapping's). File pages
    /// belong to the cache, so the mapping takes an extra reference and
    /// registers itself as a mapper.
    pub fn map_page_at(&self, vaddr: VAddr, paddr: PAddr) -> KResult<()> {
        if !page_aligned(vaddr) || !page_aligned(paddr) {
            return Err(KernError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        let region = inner.tree.find(vaddr).cloned().ok_or(KernError::InvalidArg)?;
        if inner.mmu.query(vaddr).is_some() {
            return Err(KernError::Busy);
        }
        let flags = region.map_flags();
        if let RegionBacking::File { vnode, pgoff, .. } = region.backing {
            self.env.phys.lock().inc_ref(paddr)?;
            if inner.mmu.map(vaddr, paddr, 1, flags)? != 1 {
                let _ = self.env.phys.lock().dec_ref(paddr);
                return Err(KernError::NoMemory);
            }
            let off = pgoff + ((vaddr - region.base) >> PAGE_SHIFT) as u64;
            self.env.cache.lock().add_mapper(vnode, off, self.id, vaddr);
        } else if inner.mmu.map(vaddr, paddr, 1, flags)? != 1 {
            return Err(KernError::NoMemory);
        }
        Ok(())
    }

    /// Map a run of specific physical pages at a specific virtual address:
    /// no allocation, no COW. Fails if the target range is occupied. Used
    /// for preloaded kernel-adjacent user images.
    pub fn vaddr_to_paddr_mmap(
        &self,
        vaddr: VAddr,
        paddr: PAddr,
        len: usize,
        flags: RegionFlags,
    ) -> KResult<()> {
        if !page_aligned(vaddr) || !page_aligned(paddr) || len == 0 {
            return Err(KernError::InvalidArg);
        }
        let len = page_round_up(len);
        if !self.contains_range(vaddr, len) {
            return Err(KernError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        if inner.tree.find_range(vaddr, len).is_some() {
            return Err(KernError::Busy);
        }
        let region = VmRegion {
            base: vaddr,
            size: len,
            flags: flags | RegionFlags::FIXED,
            backing: RegionBacking::Anon,
            space: self.id,
        };
        inner.tree.insert(region)?;

        let map_flags = inner.tree.get(vaddr).map(|r| r.map_flags()).unwrap_or(MapFlags::READ);
        let pages = len >> PAGE_SHIFT;
        for i in 0..pages {
            let va = vaddr + i * PAGE_SIZE;
            let pa = paddr + i * PAGE_SIZE;
            let mapped = {
                self.env.phys.lock().inc_ref(pa)?;
                inner.mmu.map(va, pa, 1, map_flags)
            };
            if mapped != Ok(1) {
                // Unwind the pages mapped so far and the region itself.
                let _ = self.env.phys.lock().dec_ref(pa);
                for j in 0..i {
                    let done = vaddr + j * PAGE_SIZE;
                    inner.mmu.unmap(done, 1);
                    let _ = self.env.phys.lock().dec_ref(paddr + j * PAGE_SIZE);
                }
                inner.tree.remove(vaddr);
                return Err(KernError::NoMemory);
            }
        }
        Ok(())
    }

    // ── Clone (fork / COW) ──────────────────────────────────────────────

    /// Copy this space's layout into `new` for fork.
    ///
    /// Every region is duplicated at the same address; every resident
    /// writable page is remapped read-only in *both* spaces and its
    /// reference count bumped, so the first write on either side faults
    /// into a private copy. Shared-memory regions share their pages
    /// as-is. On any failure the whole clone is unwound: partial COW
    /// state never escapes. Named to stay clear of `ToOwned::clone_into`,
    /// which `Arc<VmSpace>` picks up from the prelude.
    pub fn fork_into(&self, new: &Arc<VmSpace>) -> KResult<()> {
        if self.kind != SpaceKind::User || new.kind != SpaceKind::User {
            return Err(KernError::InvalidArg);
        }
        let mut old = self.inner.lock();
        if old.tree.is_empty() {
            return Err(KernError::InvalidArg);
        }
        let mut newi = new.inner.lock();
        newi.heap_base = old.heap_base;
        newi.heap_now = old.heap_now;
        newi.map_base = old.map_base;
        newi.map_size = old.map_size;

        let bases: Vec<VAddr> = old.tree.bases().collect();
        let mut added: Vec<VAddr> = Vec::new();
        let mut failed = None;

        'regions: for base in bases {
            let region = match old.tree.get(base) {
                Some(r) => r.clone(),
                None => continue,
            };
            let mut dup = region.clone();
            dup.space = new.id;
            if let Err(e) = newi.tree.insert(dup) {
                failed = Some(e);
                break;
            }
            added.push(base);
            if old.heap_region == Some(base) {
                newi.heap_region = Some(base);
            }

            let shared = matches!(region.backing, RegionBacking::Shm { .. });
            for i in 0..region.page_count() {
                let va = base + i * PAGE_SIZE;
                let (pa, flags) = match old.mmu.query(va) {
                    Some(entry) => entry,
                    None => continue,
                };
                if shared {
                    // Shared-memory fork path: same pages, same rights,
                    // ownership stays with the shm segment.
                    if newi.mmu.map(va, pa, 1, flags) != Ok(1) {
                        failed = Some(KernError::NoMemory);
                        break 'regions;
                    }
                    continue;
                }
                if self.env.phys.lock().inc_ref(pa).is_err() {
                    failed = Some(KernError::InvalidArg);
                    break 'regions;
                }
                let target = if flags.contains(MapFlags::WRITE) {
                    // Break write access in the parent first, then share
                    // the page read-only with the child.
                    let ro = flags - MapFlags::WRITE;
                    old.mmu.change_protection(va, 1, ro);
                    ro
                } else {
                    flags
                };
                if newi.mmu.map(va, pa, 1, target) != Ok(1) {
                    let _ = self.env.phys.lock().dec_ref(pa);
                    failed = Some(KernError::NoMemory);
                    break 'regions;
                }
                if let RegionBacking::File { vnode, pgoff, .. } = region.backing {
                    let off = pgoff + i as u64;
                    let mut cache = self.env.cache.lock();
                    let canonical = cache
                        .lookup(vnode, off)
                        .map(|p| p.paddr == pa && !p.cow_pending)
                        .unwrap_or(false);
                    if canonical {
                        cache.add_mapper(vnode, off, new.id, va);
                    }
                }
            }
        }

        if let Some(err) = failed {
            for base in added {
                if let Some(region) = newi.tree.get(base).cloned() {
                    new.release_region_pages(&mut newi, &region);
                    newi.tree.remove(base);
                }
            }
            newi.heap_region = None;
            return Err(err);
        }
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Tear the space down: free every region, destroy the MMU context,
    /// return the translation-table pages, unregister. The kernel space
    /// can never be freed.
    pub fn free(&self) -> KResult<()> {
        if self.is_kernel() {
            log_warn!("vm: refusing to free the kernel space");
            return Err(KernError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        if inner.dead {
            return Ok(());
        }
        let bases: Vec<VAddr> = inner.tree.bases().collect();
        for base in bases {
            if let Some(region) = inner.tree.get(base).cloned() {
                self.release_region_pages(&mut inner, &region);
                inner.tree.remove(base);
            }
        }
        inner.heap_region = None;
        inner.mmu.destroy();
        let pt_pages: Vec<PAddr> = inner.pt_pages.drain(..).collect();
        for page in pt_pages {
            let _ = self.env.phys.lock().dec_ref(page);
        }
        inner.dead = true;
        SPACE_REGISTRY.lock().retain(|&(id, _)| id != self.id);
        log_info!("vm: space {} torn down", self.id);
        Ok(())
    }
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        // Spaces that die without an explicit free (the kernel space,
        // anything still attached to a dropped manager) must still leave
        // the registry.
        SPACE_REGISTRY.lock().retain(|&(id, _)| id != self.id);
    }
}
