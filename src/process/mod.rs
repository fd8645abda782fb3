//! Process lifecycle: PCBs, groups, wait bookkeeping and the manager
//! that ties them to tasks and address spaces.

use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

pub mod group;
pub mod manager;
pub mod pcb;
pub mod wait;

pub use manager::{CloneFlags, ProcessManager, PID_IDLE, PID_INIT, PID_KERNEL, PROCESS_LIMIT};
pub use pcb::{ExitCode, Pcb, Pid, ProcMode, ProcessStatus};
pub use wait::{WaitOutcome, WaitReport};

lazy_static! {
    static ref MANAGER: Mutex<Option<Arc<ProcessManager>>> = Mutex::new(None);
}

/// Publish the boot-time manager for syscall-layer access.
pub fn install(manager: Arc<ProcessManager>) {
    *MANAGER.lock() = Some(manager);
}

/// The installed manager, if the subsystem has been brought up.
pub fn global() -> Option<Arc<ProcessManager>> {
    MANAGER.lock().clone()
}
