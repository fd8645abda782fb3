//! Process groups.
//!
//! A group is named by its leader's pid and holds two member lists: the
//! processes still alive and the ones that exited but have not been
//! reaped. The group itself is freed only when both lists are empty, so
//! a group stays findable as long as any member, dead or alive, remains.

use alloc::vec::Vec;

use crate::process::pcb::Pid;

pub struct ProcessGroup {
    pub gid: Pid,
    pub members: Vec<Pid>,
    pub exit_members: Vec<Pid>,
}

impl ProcessGroup {
    pub fn new(gid: Pid) -> Self {
        ProcessGroup { gid, members: Vec::new(), exit_members: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.exit_members.is_empty()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.members.contains(&pid) || self.exit_members.contains(&pid)
    }

    pub fn remove_member(&mut self, pid: Pid) {
        self.members.retain(|&p| p != pid);
    }

    /// Move a member from the live list to the exited list.
    pub fn member_exited(&mut self, pid: Pid) {
        self.remove_member(pid);
        if !self.exit_members.contains(&pid) {
            self.exit_members.push(pid);
        }
    }

    pub fn remove_exit_member(&mut self, pid: Pid) {
        self.exit_members.retain(|&p| p != pid);
    }
}
