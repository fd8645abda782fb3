//! Process control blocks.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;

use crate::process::wait::{Siginfo, WaitEntry};
use crate::task::TaskId;
use crate::vm::VmSpace;

pub type Pid = u32;

/// Default task priority inherited on fork when the parent has none.
pub const PRIORITY_DEFAULT: u16 = 20;
pub const PRIORITY_LOWEST: u16 = 31;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessStatus: u16 {
        const INIT         = 1 << 0;
        const READY        = 1 << 1;
        const RUNNING      = 1 << 2;
        const PENDING      = 1 << 3;
        /// Exited, exit code held for a waiting parent.
        const ZOMBIE       = 1 << 4;
        /// Exit fully processed; PCB may only linger as a group anchor.
        const EXIT         = 1 << 5;
        const UNUSED       = 1 << 6;
        const GROUP_LEADER = 1 << 7;
        /// The process has replaced its image; its group can no longer be
        /// changed by the parent.
        const ALREADY_EXEC = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMode {
    Kernel,
    User,
}

/// Packed exit-code word: exit status in bits 8..16, core-dump flag in
/// bit 7, killing signal in bits 0..7. A killing signal, once recorded,
/// is never overwritten by a later normal-exit status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitCode(u32);

impl ExitCode {
    pub fn set_exit_status(&mut self, status: u32) {
        if self.signal() == 0 {
            self.0.set_bits(8..16, status & 0xff);
        }
    }

    pub fn set_kill_signal(&mut self, signo: u32) {
        if self.signal() == 0 {
            self.0.set_bits(0..7, signo & 0x7f);
        }
    }

    pub fn set_core_dump(&mut self) {
        self.0.set_bit(7, true);
    }

    pub fn exit_status(&self) -> u32 {
        self.0.get_bits(8..16)
    }

    pub fn signal(&self) -> u32 {
        self.0.get_bits(0..7)
    }

    pub fn core_dumped(&self) -> bool {
        self.0.get_bit(7)
    }

    /// The full status word handed to waitpid callers.
    pub fn word(&self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Per-process capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// May change other processes' scheduling parameters.
        const SCHED  = 1 << 0;
        /// May signal processes of other users.
        const KILL   = 1 << 1;
        /// May move processes between groups it does not own.
        const SETPGID = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    /// Supplementary group ids.
    pub groups: Vec<u32>,
    pub caps: Caps,
}

impl User {
    pub fn root() -> Self {
        User { uid: 0, gid: 0, groups: Vec::new(), caps: Caps::all() }
    }
}

/// Open-file table. Slots hold VFS handles; the table is shared on
/// `CLONE_FILES` and deep-copied otherwise.
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    pub fds: Vec<Option<u32>>,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable::default()
    }
}

/// Per-process IPC endpoint. A child never inherits the parent's live
/// connection; fork hands it a reinitialized pool.
#[derive(Debug, Clone, Default)]
pub struct IpcPool {
    pub connected: bool,
}

impl IpcPool {
    pub fn reinit() -> Self {
        IpcPool { connected: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_files: u32,
    pub max_tasks: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits { max_files: 256, max_tasks: 64 }
    }
}

/// Interval timer state, carried but not expired here.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcTimer {
    pub interval_ms: u64,
    pub remain_ms: u64,
}

pub struct Pcb {
    pub pid: Pid,
    pub status: ProcessStatus,
    pub mode: ProcMode,
    pub name: String,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    /// Exited children not yet reaped by wait.
    pub exit_children: Vec<Pid>,
    /// Gid of the group this process belongs to.
    pub group: Option<Pid>,
    pub threads: Vec<TaskId>,
    pub main_task: Option<TaskId>,
    /// This process's tasks currently blocked in wait.
    pub wait_list: Vec<WaitEntry>,
    pub exit_code: ExitCode,
    pub space: Option<Arc<VmSpace>>,
    pub files: Option<Arc<FileTable>>,
    pub user: Option<User>,
    pub ipc: Option<IpcPool>,
    pub timer: ProcTimer,
    pub rlimit: ResourceLimits,
    pub priority: u16,
    pub umask: u32,
    pub pending: Vec<Siginfo>,
}

impl Pcb {
    pub fn unused(pid: Pid) -> Self {
        Pcb {
            pid,
            status: ProcessStatus::UNUSED,
            mode: ProcMode::Kernel,
            name: String::new(),
            parent: None,
            children: Vec::new(),
            exit_children: Vec::new(),
            group: None,
            threads: Vec::new(),
            main_task: None,
            wait_list: Vec::new(),
            exit_code: ExitCode::default(),
            space: None,
            files: None,
            user: None,
            ipc: None,
            timer: ProcTimer::default(),
            rlimit: ResourceLimits::default(),
            priority: PRIORITY_DEFAULT,
            umask: 0o022,
            pending: Vec::new(),
        }
    }

    /// Scrub every field before the PCB re-enters the free list. The pid
    /// stays, everything else reverts to the unused state.
    pub fn reset(&mut self) {
        *self = Pcb::unused(self.pid);
    }

    pub fn is_unused(&self) -> bool {
        self.status.contains(ProcessStatus::UNUSED)
    }

    pub fn is_alive(&self) -> bool {
        !self
            .status
            .intersects(ProcessStatus::UNUSED | ProcessStatus::ZOMBIE | ProcessStatus::EXIT)
    }

    pub fn is_zombie(&self) -> bool {
        self.status.contains(ProcessStatus::ZOMBIE)
    }

    pub fn is_group_leader(&self) -> bool {
        self.status.contains(ProcessStatus::GROUP_LEADER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_packs_into_high_byte() {
        let mut code = ExitCode::default();
        code.set_exit_status(7);
        assert_eq!(code.exit_status(), 7);
        assert_eq!(code.signal(), 0);
        assert_eq!(code.word(), 7 << 8);
    }

    #[test]
    fn kill_signal_wins_over_later_exit_status() {
        let mut code = ExitCode::default();
        code.set_kill_signal(9);
        code.set_exit_status(0);
        assert_eq!(code.signal(), 9);
        assert_eq!(code.exit_status(), 0);
        code.set_core_dump();
        assert!(code.core_dumped());
    }
}
