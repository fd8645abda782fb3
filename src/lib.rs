//! Process lifecycle and virtual memory management for a small
//! monolithic kernel.
//!
//! The crate has two halves. The `vm` side manages address spaces built
//! from non-overlapping regions over a reference-counted physical page
//! pool, with copy-on-write cloning for fork. The `process` side manages
//! the PCB arena, process groups, fork/exit and the waitpid family, all
//! behind a single scheduler-style lock.
//!
//! Architecture specifics are confined to the [`mmu::ArchMmu`] trait; the
//! bundled [`mmu::SoftMmu`] is a software page table that lets the whole
//! crate run hosted under `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod klog;

pub mod error;
pub mod mmu;
pub mod phys;
pub mod process;
pub mod task;
pub mod vm;

pub use error::{KResult, KernError};
