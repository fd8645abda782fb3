//! Minimal task records.
//!
//! Processes own one or more tasks; the process manager only needs
//! enough task state to block a task in wait and to clone the calling
//! task on fork. Scheduling proper lives elsewhere.

use alloc::string::String;

use crate::process::Pid;

pub type TaskId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    /// Blocked in wait until a matching child exits.
    Pending,
    Exited,
}

#[derive(Debug, Clone)]
pub struct TaskCb {
    pub tid: TaskId,
    pub process: Pid,
    pub name: String,
    pub entry: usize,
    pub stack_size: usize,
    pub priority: u16,
    pub state: TaskState,
}

impl TaskCb {
    pub fn new(
        tid: TaskId,
        process: Pid,
        name: String,
        entry: usize,
        stack_size: usize,
        priority: u16,
    ) -> Self {
        TaskCb { tid, process, name, entry, stack_size, priority, state: TaskState::Ready }
    }
}
