//! Physical page pool.
//!
//! Frame bookkeeping for one contiguous physical range: allocation of
//! contiguous or scattered runs plus per-page reference counts. Pages may
//! be referenced by several address spaces at once (copy-on-write, shared
//! file mappings); a page returns to the pool only when its count drops
//! to zero. Count mutation always happens under the owning space's region
//! mutex, never under the scheduler lock.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KResult, KernError};
use crate::mmu::{PAGE_SHIFT, PAGE_SIZE, PAddr, page_aligned};

pub struct PhysPool {
    base: PAddr,
    /// Reference count per frame; zero means free.
    frames: Vec<u32>,
}

impl PhysPool {
    /// A pool managing `count` frames starting at physical `base`.
    pub fn new(base: PAddr, count: usize) -> Self {
        assert!(page_aligned(base));
        PhysPool { base, frames: vec![0; count] }
    }

    fn index(&self, paddr: PAddr) -> KResult<usize> {
        if !page_aligned(paddr) || paddr < self.base {
            return Err(KernError::InvalidArg);
        }
        let idx = (paddr - self.base) >> PAGE_SHIFT;
        if idx >= self.frames.len() {
            return Err(KernError::InvalidArg);
        }
        Ok(idx)
    }

    fn paddr_of(&self, idx: usize) -> PAddr {
        self.base + (idx << PAGE_SHIFT)
    }

    /// Allocate one page; its reference count starts at one.
    pub fn alloc(&mut self) -> KResult<PAddr> {
        self.alloc_contiguous(1)
    }

    /// First-fit search for `count` physically consecutive free frames.
    pub fn alloc_contiguous(&mut self, count: usize) -> KResult<PAddr> {
        if count == 0 {
            return Err(KernError::InvalidArg);
        }
        let mut run = 0;
        for idx in 0..self.frames.len() {
            if self.frames[idx] == 0 {
                run += 1;
                if run == count {
                    let start = idx + 1 - count;
                    for frame in &mut self.frames[start..=idx] {
                        *frame = 1;
                    }
                    return Ok(self.paddr_of(start));
                }
            } else {
                run = 0;
            }
        }
        Err(KernError::NoMemory)
    }

    /// Allocate `count` frames wherever they are free, appending their
    /// addresses to `out`. Partial success is unwound.
    pub fn alloc_scattered(&mut self, count: usize, out: &mut Vec<PAddr>) -> KResult<usize> {
        let before = out.len();
        for idx in 0..self.frames.len() {
            if out.len() - before == count {
                break;
            }
            if self.frames[idx] == 0 {
                self.frames[idx] = 1;
                out.push(self.paddr_of(idx));
            }
        }
        let got = out.len() - before;
        if got < count {
            for paddr in out.drain(before..) {
                let idx = (paddr - self.base) >> PAGE_SHIFT;
                self.frames[idx] = 0;
            }
            return Err(KernError::NoMemory);
        }
        Ok(got)
    }

    pub fn ref_count(&self, paddr: PAddr) -> KResult<u32> {
        Ok(self.frames[self.index(paddr)?])
    }

    pub fn inc_ref(&mut self, paddr: PAddr) -> KResult<u32> {
        let idx = self.index(paddr)?;
        if self.frames[idx] == 0 {
            // Taking a reference on a free frame means the caller's
            // bookkeeping is already corrupt.
            panic!("phys: inc_ref on free frame {:#x}", paddr);
        }
        self.frames[idx] += 1;
        Ok(self.frames[idx])
    }

    /// Drop one reference; the frame is reclaimed when the count hits zero.
    /// Returns the remaining count.
    pub fn dec_ref(&mut self, paddr: PAddr) -> KResult<u32> {
        let idx = self.index(paddr)?;
        if self.frames[idx] == 0 {
            // Double release is a fatal invariant violation, not an error.
            panic!("phys: double free of frame {:#x}", paddr);
        }
        self.frames[idx] -= 1;
        Ok(self.frames[idx])
    }

    /// Number of frames currently referenced by anyone.
    pub fn used(&self) -> usize {
        self.frames.iter().filter(|&&c| c > 0).count()
    }

    pub fn total(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, paddr: PAddr) -> bool {
        self.index(paddr).is_ok()
    }
}

/// Translate a physical page address to the kernel-visible alias. With an
/// identity-mapped kernel window this is the address itself.
pub fn page_to_kernel_vaddr(paddr: PAddr) -> usize {
    paddr
}

/// Inverse of [`page_to_kernel_vaddr`].
pub fn kernel_vaddr_to_page(vaddr: usize) -> PAddr {
    vaddr & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_alloc_is_first_fit() {
        let mut pool = PhysPool::new(0x10_0000, 8);
        let a = pool.alloc_contiguous(2).unwrap();
        assert_eq!(a, 0x10_0000);
        let b = pool.alloc_contiguous(3).unwrap();
        assert_eq!(b, 0x10_2000);
        assert_eq!(pool.used(), 5);
    }

    #[test]
    fn refcount_reclaims_at_zero() {
        let mut pool = PhysPool::new(0x10_0000, 2);
        let page = pool.alloc().unwrap();
        assert_eq!(pool.inc_ref(page).unwrap(), 2);
        assert_eq!(pool.dec_ref(page).unwrap(), 1);
        assert_eq!(pool.dec_ref(page).unwrap(), 0);
        // Slot is free again.
        assert_eq!(pool.alloc().unwrap(), page);
    }

    #[test]
    fn scattered_alloc_unwinds_on_exhaustion() {
        let mut pool = PhysPool::new(0x10_0000, 3);
        let mut pages = Vec::new();
        assert_eq!(pool.alloc_scattered(5, &mut pages), Err(KernError::NoMemory));
        assert!(pages.is_empty());
        assert_eq!(pool.used(), 0);
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut pool = PhysPool::new(0x10_0000, 1);
        let page = pool.alloc().unwrap();
        pool.dec_ref(page).unwrap();
        let _ = pool.dec_ref(page);
    }
}
