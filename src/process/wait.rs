//! Wait bookkeeping: matchers, ordered wait lists and wake selection.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::{KResult, KernError};
use crate::process::pcb::Pid;
use crate::task::TaskId;

pub const SIGKILL: u32 = 9;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;

pub const CLD_EXITED: i32 = 1;
pub const CLD_KILLED: i32 = 2;
pub const CLD_DUMPED: i32 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        const WNOHANG    = 1 << 0;
        const WUNTRACED  = 1 << 1;
        const WCONTINUED = 1 << 3;
        const WNOWAIT    = 1 << 24;
    }
}

/// Validate waitpid/waitid options: unknown bits are an error, stop and
/// continue reporting is recognized but not implemented.
pub fn check_options(options: u32) -> KResult<WaitOptions> {
    let parsed = WaitOptions::from_bits(options).ok_or(KernError::InvalidArg)?;
    if parsed.intersects(WaitOptions::WUNTRACED | WaitOptions::WCONTINUED | WaitOptions::WNOWAIT) {
        return Err(KernError::NotSupported);
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMatch {
    /// Wait for one specific child.
    Pid(Pid),
    /// Wait for any child in the given group.
    Group(Pid),
    /// Wait for any child.
    Any,
}

/// Decode a waitpid pid argument.
pub fn decode_pid_arg(pid: i32, own_group: Pid) -> KResult<WaitMatch> {
    if pid > 0 {
        Ok(WaitMatch::Pid(pid as Pid))
    } else if pid == 0 {
        Ok(WaitMatch::Group(own_group))
    } else if pid == -1 {
        Ok(WaitMatch::Any)
    } else {
        let gid = pid.checked_neg().ok_or(KernError::InvalidArg)? as Pid;
        Ok(WaitMatch::Group(gid))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitEntry {
    pub task: TaskId,
    pub matcher: WaitMatch,
}

/// Insert a waiter keeping the list in wake-priority order: pid waiters
/// first, then group waiters, then any-child waiters. Within a class the
/// newest waiter goes last.
pub fn insert_ordered(list: &mut Vec<WaitEntry>, entry: WaitEntry) {
    let class = |m: &WaitMatch| match m {
        WaitMatch::Pid(_) => 0,
        WaitMatch::Group(_) => 1,
        WaitMatch::Any => 2,
    };
    let mine = class(&entry.matcher);
    let at = list
        .iter()
        .position(|e| class(&e.matcher) > mine)
        .unwrap_or(list.len());
    list.insert(at, entry);
}

/// Value a woken waiter resumes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeVal {
    /// This child exited; reap it on resume.
    Pid(Pid),
    /// The last child is gone; the wait fails with no-child.
    NoChild,
    /// The wait was cancelled by a signal.
    Interrupted,
}

/// Select the waiters satisfied by a child's exit and remove them from
/// the list. Pid and group waiters matching the child wake first, then
/// every any-child waiter. Waiters pinned to other pids or groups stay.
pub fn compute_wakes(
    list: &mut Vec<WaitEntry>,
    child: Pid,
    child_gid: Option<Pid>,
) -> Vec<(TaskId, WakeVal)> {
    let mut woken = Vec::new();
    list.retain(|entry| {
        let hit = match entry.matcher {
            WaitMatch::Pid(p) => p == child,
            WaitMatch::Group(g) => child_gid == Some(g),
            WaitMatch::Any => true,
        };
        if hit {
            woken.push((entry.task, WakeVal::Pid(child)));
        }
        !hit
    });
    woken
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Siginfo {
    pub signo: i32,
    pub code: i32,
    pub pid: Pid,
    pub uid: u32,
    pub status: i32,
}

/// The child-exit report a successful wait returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    pub pid: Pid,
    /// Packed exit-code word.
    pub status: u32,
    pub info: Siginfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A child was reaped immediately.
    Collected(WaitReport),
    /// The caller's task is parked on the wait list; resume it with
    /// `wait_resume` once a wake is pending.
    Blocked,
}
