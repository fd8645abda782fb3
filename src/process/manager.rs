//! The process manager: PCB arena, fork, exit, wait and process groups.
//!
//! All process bookkeeping lives behind one spinlock, the equivalent of
//! a scheduler lock. Address-space work never runs under it: fork clones
//! memory between two lock scopes, and exited spaces are torn down after
//! the lock is dropped.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KResult, KernError};
use crate::mmu::SoftMmu;
use crate::process::group::ProcessGroup;
use crate::process::pcb::{
    Caps, ExitCode, FileTable, IpcPool, Pcb, Pid, ProcMode, ProcessStatus, User,
    PRIORITY_LOWEST,
};
use crate::process::wait::{
    check_options, compute_wakes, decode_pid_arg, insert_ordered, Siginfo, WaitEntry, WaitMatch,
    WaitOptions, WaitOutcome, WaitReport, WakeVal, CLD_DUMPED, CLD_EXITED, CLD_KILLED, SIGCHLD,
};
use crate::task::{TaskCb, TaskId, TaskState};
use crate::vm::{MemoryEnv, SpaceKind, VmSpace};

pub const PROCESS_LIMIT: usize = 64;

/// The three root processes, created at boot and never reaped.
pub const PID_IDLE: Pid = 0;
pub const PID_INIT: Pid = 1;
pub const PID_KERNEL: Pid = 2;

const DEFAULT_STACK: usize = 0x4000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Share the parent's address space instead of copying it.
        const VM     = 0x0000_0100;
        const FILES  = 0x0000_0400;
        const VFORK  = 0x0000_4000;
        /// The child becomes a sibling of the caller.
        const PARENT = 0x0000_8000;
        const THREAD = 0x0001_0000;
    }
}

struct ProcInner {
    pcbs: Vec<Pcb>,
    free: VecDeque<Pid>,
    /// Exited processes whose resources still need releasing.
    recycle: VecDeque<Pid>,
    groups: BTreeMap<Pid, ProcessGroup>,
    tasks: BTreeMap<TaskId, TaskCb>,
    next_tid: TaskId,
    current: Pid,
    /// Wake values for tasks pulled off wait lists, consumed by
    /// `wait_resume`.
    pending_wakes: Vec<(TaskId, WakeVal)>,
    /// Spaces detached from reaped PCBs, freed once the lock is dropped.
    orphan_spaces: Vec<Arc<VmSpace>>,
}

pub struct ProcessManager {
    env: Arc<MemoryEnv>,
    pub kernel_space: Arc<VmSpace>,
    pub vmalloc_space: Arc<VmSpace>,
    inner: Mutex<ProcInner>,
}

impl ProcInner {
    fn pcb(&self, pid: Pid) -> KResult<&Pcb> {
        self.pcbs
            .get(pid as usize)
            .filter(|p| !p.is_unused())
            .ok_or(KernError::NoSuchProcess)
    }

    fn alloc_pcb(&mut self) -> KResult<Pid> {
        self.free.pop_front().ok_or(KernError::NoMemory)
    }

    fn spawn_task(&mut self, pid: Pid, name: &str, entry: usize, stack: usize) -> TaskId {
        let tid = self.next_tid;
        self.next_tid += 1;
        let priority = self.pcbs[pid as usize].priority;
        self.tasks
            .insert(tid, TaskCb::new(tid, pid, name.to_string(), entry, stack, priority));
        let pcb = &mut self.pcbs[pid as usize];
        pcb.threads.push(tid);
        if pcb.main_task.is_none() {
            pcb.main_task = Some(tid);
        }
        tid
    }

    /// Start a new group led by `pid`.
    fn create_group(&mut self, pid: Pid) {
        let mut group = ProcessGroup::new(pid);
        group.members.push(pid);
        self.groups.insert(pid, group);
        let pcb = &mut self.pcbs[pid as usize];
        pcb.group = Some(pid);
        pcb.status.insert(ProcessStatus::GROUP_LEADER);
    }

    fn join_group(&mut self, pid: Pid, gid: Pid) -> KResult<()> {
        let group = self.groups.get_mut(&gid).ok_or(KernError::NoSuchProcess)?;
        group.members.push(pid);
        self.pcbs[pid as usize].group = Some(gid);
        Ok(())
    }

    /// Remove `pid` from whatever group it is in, freeing the group when
    /// its last member (dead or alive) goes away.
    fn drop_group_membership(&mut self, pid: Pid) {
        let gid = match self.pcbs[pid as usize].group.take() {
            Some(g) => g,
            None => return,
        };
        if pid == gid {
            self.pcbs[pid as usize].status.remove(ProcessStatus::GROUP_LEADER);
        }
        let empty = match self.groups.get_mut(&gid) {
            Some(group) => {
                group.remove_member(pid);
                group.remove_exit_member(pid);
                group.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove(&gid);
            self.release_group_anchor(gid);
        }
    }

    /// A group leader that exited may linger only to pin its gid. Once
    /// the group is gone, hand the PCB back to the free list.
    fn release_group_anchor(&mut self, gid: Pid) {
        let pcb = &mut self.pcbs[gid as usize];
        if pcb.status.contains(ProcessStatus::EXIT) && pcb.is_group_leader() {
            if let Some(space) = pcb.space.take() {
                self.orphan_spaces.push(space);
            }
            pcb.reset();
            self.recycle.retain(|&p| p != gid);
            self.free.push_back(gid);
        }
    }

    /// Final release of a zombie: drop its group exit membership and
    /// return the PCB to the free list, unless it must stay behind as a
    /// group anchor.
    fn release_zombie(&mut self, pid: Pid) {
        if let Some(gid) = self.pcbs[pid as usize].group.take() {
            let empty = match self.groups.get_mut(&gid) {
                Some(group) => {
                    group.remove_exit_member(pid);
                    group.remove_member(pid);
                    group.is_empty()
                }
                None => false,
            };
            if empty {
                self.groups.remove(&gid);
                if gid != pid {
                    self.release_group_anchor(gid);
                }
            } else if gid == pid {
                // Leader with surviving members: keep the PCB as anchor.
                let pcb = &mut self.pcbs[pid as usize];
                pcb.group = Some(gid);
                pcb.status.remove(ProcessStatus::ZOMBIE);
                pcb.status.insert(ProcessStatus::EXIT);
                if let Some(space) = pcb.space.take() {
                    self.orphan_spaces.push(space);
                }
                return;
            }
        }
        let pcb = &mut self.pcbs[pid as usize];
        if let Some(space) = pcb.space.take() {
            self.orphan_spaces.push(space);
        }
        pcb.reset();
        self.recycle.retain(|&p| p != pid);
        self.free.push_back(pid);
    }

    /// Look for a reapable child of `cur` matching `matcher`. Errors when
    /// no child, dead or alive, can ever match.
    fn find_waitable(&self, cur: Pid, matcher: WaitMatch) -> KResult<Option<Pid>> {
        let me = &self.pcbs[cur as usize];
        match matcher {
            WaitMatch::Pid(p) => {
                let is_child = me.children.contains(&p) || me.exit_children.contains(&p);
                if !is_child {
                    return Err(KernError::NoSuchChild);
                }
                Ok(me.exit_children.iter().copied().find(|&c| c == p))
            }
            WaitMatch::Group(g) => {
                let in_group = |&c: &Pid| self.pcbs[c as usize].group == Some(g);
                let any = me.children.iter().any(|c| in_group(c))
                    || me.exit_children.iter().any(|c| in_group(c));
                if !any {
                    return Err(KernError::NoSuchChild);
                }
                Ok(me.exit_children.iter().copied().find(|c| in_group(c)))
            }
            WaitMatch::Any => {
                if me.children.is_empty() && me.exit_children.is_empty() {
                    return Err(KernError::NoSuchChild);
                }
                Ok(me.exit_children.first().copied())
            }
        }
    }

    /// Copy out a zombie child's exit report and release it.
    fn reap(&mut self, parent: Pid, child: Pid) -> WaitReport {
        self.pcbs[parent as usize].exit_children.retain(|&c| c != child);
        let code = self.pcbs[child as usize].exit_code;
        let uid = self.pcbs[child as usize].user.as_ref().map_or(0, |u| u.uid);
        let (cld, status) = if code.signal() != 0 {
            let cld = if code.core_dumped() { CLD_DUMPED } else { CLD_KILLED };
            (cld, code.signal() as i32)
        } else {
            (CLD_EXITED, code.exit_status() as i32)
        };
        let info = Siginfo { signo: SIGCHLD as i32, code: cld, pid: child, uid, status };
        self.release_zombie(child);

        // That was the last child: any waiter still parked can never be
        // satisfied, so fail it with no-child.
        let leftovers: Vec<WaitEntry> = {
            let me = &mut self.pcbs[parent as usize];
            if me.children.is_empty() && me.exit_children.is_empty() && !me.wait_list.is_empty() {
                me.status.remove(ProcessStatus::PENDING);
                core::mem::take(&mut me.wait_list)
            } else {
                Vec::new()
            }
        };
        for entry in leftovers {
            if let Some(t) = self.tasks.get_mut(&entry.task) {
                t.state = TaskState::Ready;
            }
            self.pending_wakes.push((entry.task, WakeVal::NoChild));
        }

        WaitReport { pid: child, status: code.word(), info }
    }

    fn deliver(&mut self, pid: Pid, info: Siginfo) {
        self.pcbs[pid as usize].pending.push(info);
    }
}

impl ProcessManager {
    /// Boot the process subsystem: kernel and vmalloc spaces, the PCB
    /// arena, and the three root processes.
    pub fn new(env: Arc<MemoryEnv>) -> KResult<Self> {
        let kttb = env.phys.lock().alloc()?;
        let kernel_space =
            VmSpace::init(SpaceKind::Kernel, env.clone(), Box::new(SoftMmu::new(kttb)));
        let vttb = env.phys.lock().alloc()?;
        let vmalloc_space =
            VmSpace::init(SpaceKind::VMalloc, env.clone(), Box::new(SoftMmu::new(vttb)));

        let mut inner = ProcInner {
            pcbs: (0..PROCESS_LIMIT).map(|i| Pcb::unused(i as Pid)).collect(),
            free: (3..PROCESS_LIMIT as Pid).collect(),
            recycle: VecDeque::new(),
            groups: BTreeMap::new(),
            tasks: BTreeMap::new(),
            next_tid: 1,
            current: PID_KERNEL,
            pending_wakes: Vec::new(),
            orphan_spaces: Vec::new(),
        };

        // Kernel root.
        {
            let pcb = &mut inner.pcbs[PID_KERNEL as usize];
            pcb.status = ProcessStatus::RUNNING;
            pcb.mode = ProcMode::Kernel;
            pcb.name = String::from("KProcess");
            pcb.user = Some(User::root());
            pcb.space = Some(kernel_space.clone());
            pcb.ipc = Some(IpcPool::reinit());
        }
        inner.create_group(PID_KERNEL);
        inner.spawn_task(PID_KERNEL, "KProcess", 0, DEFAULT_STACK);

        // Idle, a kernel child of the kernel root.
        {
            let pcb = &mut inner.pcbs[PID_IDLE as usize];
            pcb.status = ProcessStatus::READY;
            pcb.mode = ProcMode::Kernel;
            pcb.name = String::from("KIdle");
            pcb.parent = Some(PID_KERNEL);
            pcb.user = Some(User::root());
            pcb.space = Some(kernel_space.clone());
            pcb.priority = PRIORITY_LOWEST;
        }
        inner.pcbs[PID_KERNEL as usize].children.push(PID_IDLE);
        inner.join_group(PID_IDLE, PID_KERNEL)?;
        inner.spawn_task(PID_IDLE, "KIdle", 0, DEFAULT_STACK);

        // User init, root of the user process tree.
        let init_space = VmSpace::create_user(env.clone())?;
        {
            let pcb = &mut inner.pcbs[PID_INIT as usize];
            pcb.status = ProcessStatus::READY;
            pcb.mode = ProcMode::User;
            pcb.name = String::from("Init");
            pcb.user = Some(User::root());
            pcb.space = Some(init_space);
            pcb.files = Some(Arc::new(FileTable::new()));
            pcb.ipc = Some(IpcPool::reinit());
        }
        inner.create_group(PID_INIT);
        inner.spawn_task(PID_INIT, "Init", 0, DEFAULT_STACK);

        log_info!("proc: manager up, {} pids", PROCESS_LIMIT);
        Ok(ProcessManager { env, kernel_space, vmalloc_space, inner: Mutex::new(inner) })
    }

    pub fn current(&self) -> Pid {
        self.inner.lock().current
    }

    /// Scheduler/test hook: make `pid` the running process.
    pub fn set_current(&self, pid: Pid) -> KResult<()> {
        let space = {
            let mut inner = self.inner.lock();
            if !inner.pcb(pid)?.is_alive() {
                return Err(KernError::NoSuchProcess);
            }
            let prev = inner.current;
            if prev != pid {
                let prev_pcb = &mut inner.pcbs[prev as usize];
                if prev_pcb.status.contains(ProcessStatus::RUNNING) {
                    prev_pcb.status.remove(ProcessStatus::RUNNING);
                    prev_pcb.status.insert(ProcessStatus::READY);
                }
            }
            let pcb = &mut inner.pcbs[pid as usize];
            pcb.status.remove(ProcessStatus::READY);
            pcb.status.insert(ProcessStatus::RUNNING);
            let space = pcb.space.clone();
            inner.current = pid;
            space
        };
        if let Some(space) = space {
            space.context_switch();
        }
        Ok(())
    }

    // ── Fork ────────────────────────────────────────────────────────────

    /// Create a child of the current process. Returns the child's pid;
    /// the child is READY, never scheduled here.
    pub fn fork(
        &self,
        flags: CloneFlags,
        name: &str,
        entry: usize,
        stack_size: usize,
    ) -> KResult<Pid> {
        if flags.contains(CloneFlags::THREAD) {
            return Err(KernError::NotSupported);
        }
        let stack = if stack_size == 0 { DEFAULT_STACK } else { stack_size };

        // Phase 1: PCB and bookkeeping under the lock.
        let (child, task, link_parent, parent_space, parent_gid, mode) = {
            let mut inner = self.inner.lock();
            let parent = inner.current;
            let child = inner.alloc_pcb()?;
            let link_parent = if flags.contains(CloneFlags::PARENT) {
                match inner.pcbs[parent as usize].parent {
                    Some(gp) => gp,
                    None => {
                        inner.free.push_front(child);
                        return Err(KernError::InvalidArg);
                    }
                }
            } else {
                parent
            };

            let (mode, user, files, timer, rlimit, priority, umask, parent_space, parent_gid) = {
                let p = &inner.pcbs[parent as usize];
                let files = if flags.contains(CloneFlags::FILES) {
                    p.files.clone()
                } else {
                    p.files.as_ref().map(|f| Arc::new(FileTable::clone(f)))
                };
                (
                    p.mode,
                    p.user.clone(),
                    files,
                    p.timer,
                    p.rlimit,
                    p.priority,
                    p.umask,
                    p.space.clone(),
                    p.group,
                )
            };

            {
                let pcb = &mut inner.pcbs[child as usize];
                pcb.status = ProcessStatus::INIT;
                pcb.mode = mode;
                pcb.name = name.to_string();
                pcb.parent = Some(link_parent);
                pcb.user = user;
                pcb.files = files;
                pcb.timer = timer;
                pcb.rlimit = rlimit;
                pcb.priority = priority;
                pcb.umask = umask;
                pcb.ipc = Some(IpcPool::reinit());
                pcb.exit_code = ExitCode::default();
            }
            inner.pcbs[link_parent as usize].children.push(child);
            let task = inner.spawn_task(child, name, entry, stack);
            (child, task, link_parent, parent_space, parent_gid, mode)
        };

        // Phase 2: address space, without the process lock.
        let space = match mode {
            ProcMode::Kernel => self.kernel_space.clone(),
            ProcMode::User if flags.contains(CloneFlags::VM) => match parent_space {
                Some(s) => s,
                None => {
                    self.fork_unwind(child, task, link_parent, None);
                    return Err(KernError::InvalidArg);
                }
            },
            ProcMode::User => {
                let parent_space = match parent_space {
                    Some(s) => s,
                    None => {
                        self.fork_unwind(child, task, link_parent, None);
                        return Err(KernError::InvalidArg);
                    }
                };
                let child_space = match VmSpace::create_user(self.env.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        self.fork_unwind(child, task, link_parent, None);
                        return Err(e);
                    }
                };
                if let Err(e) = parent_space.fork_into(&child_space) {
                    self.fork_unwind(child, task, link_parent, Some(child_space));
                    return Err(e);
                }
                child_space
            }
        };

        // Phase 3: attach and publish.
        {
            let mut inner = self.inner.lock();
            inner.pcbs[child as usize].space = Some(space);
            // Children forked out of the kernel root's group start their
            // own group; everyone else stays in the parent's.
            match parent_gid {
                Some(gid) if gid != PID_KERNEL || mode == ProcMode::Kernel => {
                    inner.join_group(child, gid)?;
                }
                _ => inner.create_group(child),
            }
            let pcb = &mut inner.pcbs[child as usize];
            pcb.status.remove(ProcessStatus::INIT);
            pcb.status.insert(ProcessStatus::READY);
        }
        log_info!("proc: forked {} ({})", child, name);
        Ok(child)
    }

    fn fork_unwind(
        &self,
        child: Pid,
        task: TaskId,
        link_parent: Pid,
        space: Option<Arc<VmSpace>>,
    ) {
        if let Some(space) = space {
            let _ = space.free();
        }
        let mut inner = self.inner.lock();
        inner.tasks.remove(&task);
        inner.pcbs[link_parent as usize].children.retain(|&c| c != child);
        inner.pcbs[child as usize].reset();
        inner.free.push_back(child);
    }

    // ── Exit ────────────────────────────────────────────────────────────

    /// Terminate the current process with an exit status.
    pub fn exit_current(&self, status: u32) -> KResult<()> {
        let cur = self.inner.lock().current;
        self.natural_exit(cur, status)
    }

    /// Forcibly terminate `pid` as if killed by `signo`. The three root
    /// processes cannot be killed.
    pub fn kill(&self, pid: Pid, signo: u32) -> KResult<()> {
        if pid == PID_IDLE || pid == PID_INIT || pid == PID_KERNEL {
            return Err(KernError::PermissionDenied);
        }
        {
            let mut inner = self.inner.lock();
            if !inner.pcb(pid)?.is_alive() {
                return Err(KernError::NoSuchProcess);
            }
            let uid = inner.pcbs[inner.current as usize].user.as_ref().map_or(0, |u| u.uid);
            let from = inner.current;
            inner.pcbs[pid as usize].exit_code.set_kill_signal(signo);
            inner.deliver(
                pid,
                Siginfo { signo: signo as i32, code: 0, pid: from, uid, status: 0 },
            );
        }
        self.natural_exit(pid, 0)
    }

    /// Full exit path: release already-exited children, hand live ones to
    /// the heir root, become a zombie on the parent's exit list, wake
    /// matching waiters and queue the resources for recycling.
    pub fn natural_exit(&self, pid: Pid, status: u32) -> KResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.pcb(pid)?.is_alive() {
                return Err(KernError::NoSuchProcess);
            }

            // Zombie children nobody will wait for anymore.
            let stale: Vec<Pid> = core::mem::take(&mut inner.pcbs[pid as usize].exit_children);
            for z in stale {
                inner.release_zombie(z);
            }

            // Live children go to the matching root process.
            let heir = match inner.pcbs[pid as usize].mode {
                ProcMode::User => PID_INIT,
                ProcMode::Kernel => PID_KERNEL,
            };
            let kids: Vec<Pid> = core::mem::take(&mut inner.pcbs[pid as usize].children);
            for kid in kids {
                inner.pcbs[kid as usize].parent = Some(heir);
                inner.pcbs[heir as usize].children.push(kid);
            }

            inner.pcbs[pid as usize].exit_code.set_exit_status(status);

            let parent = match inner.pcbs[pid as usize].parent {
                Some(p) => p,
                // Root processes never exit.
                None => panic!("proc: process {} exiting with no parent", pid),
            };
            inner.pcbs[parent as usize].children.retain(|&c| c != pid);
            inner.pcbs[parent as usize].exit_children.push(pid);

            let gid = inner.pcbs[pid as usize].group;
            if let Some(g) = gid {
                if let Some(group) = inner.groups.get_mut(&g) {
                    group.member_exited(pid);
                }
            }

            let woken = compute_wakes(&mut inner.pcbs[parent as usize].wait_list, pid, gid);
            if inner.pcbs[parent as usize].wait_list.is_empty() {
                inner.pcbs[parent as usize].status.remove(ProcessStatus::PENDING);
            }
            for &(task, _) in &woken {
                if let Some(t) = inner.tasks.get_mut(&task) {
                    t.state = TaskState::Ready;
                }
            }
            inner.pending_wakes.extend(woken);

            // Tear down the tasks and become a zombie.
            let threads: Vec<TaskId> = core::mem::take(&mut inner.pcbs[pid as usize].threads);
            for tid in threads {
                inner.tasks.remove(&tid);
            }
            inner.pcbs[pid as usize].main_task = None;
            let pcb = &mut inner.pcbs[pid as usize];
            pcb.status.remove(
                ProcessStatus::RUNNING | ProcessStatus::READY | ProcessStatus::PENDING,
            );
            pcb.status.insert(ProcessStatus::ZOMBIE);

            let code = inner.pcbs[pid as usize].exit_code;
            let uid = inner.pcbs[pid as usize].user.as_ref().map_or(0, |u| u.uid);
            let cld = if code.signal() != 0 {
                if code.core_dumped() { CLD_DUMPED } else { CLD_KILLED }
            } else {
                CLD_EXITED
            };
            inner.deliver(
                parent,
                Siginfo {
                    signo: SIGCHLD as i32,
                    code: cld,
                    pid,
                    uid,
                    status: code.word() as i32,
                },
            );
            inner.recycle.push_front(pid);
            log_info!("proc: {} exited, status {:#x}", pid, code.word());
        }
        self.free_orphans();
        Ok(())
    }

    /// Release the resources of everything on the recycle list. Space
    /// teardown happens with the process lock dropped; the zombie PCBs
    /// themselves stay for wait.
    pub fn recycle_to_free(&self) {
        loop {
            let space = {
                let mut inner = self.inner.lock();
                let pid = match inner.recycle.pop_front() {
                    Some(p) => p,
                    None => break,
                };
                inner.pcbs[pid as usize].space.take()
            };
            if let Some(space) = space {
                if !space.is_kernel() && Arc::strong_count(&space) == 1 {
                    let _ = space.free();
                }
            }
        }
    }

    fn free_orphans(&self) {
        let orphans: Vec<Arc<VmSpace>> = {
            let mut inner = self.inner.lock();
            core::mem::take(&mut inner.orphan_spaces)
        };
        for space in orphans {
            if !space.is_kernel() && Arc::strong_count(&space) == 1 {
                let _ = space.free();
            }
        }
    }

    // ── Wait ────────────────────────────────────────────────────────────

    /// waitpid: reap a matching zombie child now, or park the caller's
    /// main task on the wait list.
    pub fn wait(&self, pid_arg: i32, options: u32) -> KResult<WaitOutcome> {
        let opts = check_options(options)?;
        let outcome = {
            let mut inner = self.inner.lock();
            let cur = inner.current;
            let own_gid = inner.pcbs[cur as usize].group.ok_or(KernError::InvalidArg)?;
            let matcher = decode_pid_arg(pid_arg, own_gid)?;

            match inner.find_waitable(cur, matcher)? {
                Some(zombie) => WaitOutcome::Collected(inner.reap(cur, zombie)),
                None if opts.contains(WaitOptions::WNOHANG) => {
                    return Err(KernError::WouldBlock);
                }
                None => {
                    let task = inner.pcbs[cur as usize]
                        .main_task
                        .ok_or(KernError::InvalidArg)?;
                    insert_ordered(
                        &mut inner.pcbs[cur as usize].wait_list,
                        WaitEntry { task, matcher },
                    );
                    if let Some(t) = inner.tasks.get_mut(&task) {
                        t.state = TaskState::Pending;
                    }
                    inner.pcbs[cur as usize].status.insert(ProcessStatus::PENDING);
                    WaitOutcome::Blocked
                }
            }
        };
        self.free_orphans();
        Ok(outcome)
    }

    /// Complete a wait whose task was woken by a child's exit.
    pub fn wait_resume(&self, task: TaskId) -> KResult<WaitReport> {
        let result = {
            let mut inner = self.inner.lock();
            let at = inner
                .pending_wakes
                .iter()
                .position(|&(t, _)| t == task)
                .ok_or(KernError::WouldBlock)?;
            let (_, val) = inner.pending_wakes.remove(at);
            match val {
                WakeVal::Pid(child) => {
                    let parent = inner
                        .tasks
                        .get(&task)
                        .map(|t| t.process)
                        .ok_or(KernError::NoSuchProcess)?;
                    if !inner.pcbs[parent as usize].exit_children.contains(&child) {
                        // Another waiter got there first; retry the wait.
                        return Err(KernError::WouldBlock);
                    }
                    Ok(inner.reap(parent, child))
                }
                WakeVal::NoChild => Err(KernError::NoSuchChild),
                WakeVal::Interrupted => Err(KernError::Interrupted),
            }
        };
        self.free_orphans();
        result
    }

    /// Pull a parked waiter off its wait list, e.g. on signal delivery.
    /// Its next `wait_resume` fails with `Interrupted`.
    pub fn wait_cancel(&self, task: TaskId) -> KResult<()> {
        let mut inner = self.inner.lock();
        let process = inner
            .tasks
            .get(&task)
            .map(|t| t.process)
            .ok_or(KernError::NoSuchProcess)?;
        let list = &mut inner.pcbs[process as usize].wait_list;
        let before = list.len();
        list.retain(|e| e.task != task);
        if list.len() == before {
            return Err(KernError::InvalidArg);
        }
        if inner.pcbs[process as usize].wait_list.is_empty() {
            inner.pcbs[process as usize].status.remove(ProcessStatus::PENDING);
        }
        if let Some(t) = inner.tasks.get_mut(&task) {
            t.state = TaskState::Ready;
        }
        inner.pending_wakes.push((task, WakeVal::Interrupted));
        Ok(())
    }

    // ── Groups ──────────────────────────────────────────────────────────

    pub fn get_process_group(&self, pid: Pid) -> KResult<Pid> {
        let inner = self.inner.lock();
        inner.pcb(pid)?.group.ok_or(KernError::NoSuchProcess)
    }

    /// setpgid: move `pid` (self or an un-exec'd child) into `gid`, or
    /// into a fresh group it leads when `gid == pid`.
    pub fn set_process_group(&self, pid: Pid, gid: Pid) -> KResult<()> {
        let mut inner = self.inner.lock();
        let cur = inner.current;
        if !inner.pcb(pid)?.is_alive() {
            return Err(KernError::NoSuchProcess);
        }
        if pid != cur && inner.pcbs[pid as usize].parent != Some(cur) {
            return Err(KernError::PermissionDenied);
        }
        if pid != cur
            && inner.pcbs[pid as usize]
                .status
                .contains(ProcessStatus::ALREADY_EXEC)
        {
            return Err(KernError::PermissionDenied);
        }
        // The kernel root's group is off limits in both directions.
        if inner.pcbs[pid as usize].mode == ProcMode::Kernel || gid == PID_KERNEL {
            return Err(KernError::PermissionDenied);
        }
        if inner.pcbs[pid as usize].group == Some(gid) {
            return Ok(());
        }
        // Joining an existing group: its leader must still hold the
        // leader flag, and unless the leader is the moved process's own
        // parent, both must share a parent. Groups elsewhere in the tree
        // are out of reach.
        if gid != pid {
            let parent = inner.pcbs[pid as usize].parent;
            let reachable = match inner.pcbs.get(gid as usize) {
                Some(leader)
                    if !leader.is_unused()
                        && leader.is_group_leader()
                        && inner.groups.contains_key(&gid) =>
                {
                    parent == Some(gid) || leader.parent == parent
                }
                _ => false,
            };
            if !reachable {
                return Err(KernError::PermissionDenied);
            }
        }
        inner.drop_group_membership(pid);
        if gid == pid {
            inner.create_group(pid);
            Ok(())
        } else {
            inner.join_group(pid, gid)
        }
    }

    // ── Signals ─────────────────────────────────────────────────────────

    /// Deliver `signo` to every live member of a group, the idle process
    /// excepted. Succeeds if anyone got it.
    pub fn send_signal_to_group(&self, gid: Pid, signo: u32) -> KResult<usize> {
        let mut inner = self.inner.lock();
        let members: Vec<Pid> = inner
            .groups
            .get(&gid)
            .ok_or(KernError::NoSuchProcess)?
            .members
            .clone();
        let from = inner.current;
        let uid = inner.pcbs[from as usize].user.as_ref().map_or(0, |u| u.uid);
        let mut delivered = 0;
        for pid in members {
            if pid == PID_IDLE || !inner.pcbs[pid as usize].is_alive() {
                continue;
            }
            inner.deliver(
                pid,
                Siginfo { signo: signo as i32, code: 0, pid: from, uid, status: 0 },
            );
            delivered += 1;
        }
        if delivered == 0 {
            return Err(KernError::NoSuchProcess);
        }
        Ok(delivered)
    }

    /// kill(-1): deliver to every live process except idle and the caller.
    pub fn send_signal_to_all(&self, signo: u32) -> KResult<usize> {
        let mut inner = self.inner.lock();
        let from = inner.current;
        let uid = inner.pcbs[from as usize].user.as_ref().map_or(0, |u| u.uid);
        let targets: Vec<Pid> = inner
            .pcbs
            .iter()
            .filter(|p| p.is_alive() && p.pid != PID_IDLE && p.pid != from)
            .map(|p| p.pid)
            .collect();
        let mut delivered = 0;
        for pid in targets {
            inner.deliver(
                pid,
                Siginfo { signo: signo as i32, code: 0, pid: from, uid, status: 0 },
            );
            delivered += 1;
        }
        if delivered == 0 {
            return Err(KernError::NoSuchProcess);
        }
        Ok(delivered)
    }

    // ── Scheduling parameters ───────────────────────────────────────────

    pub fn get_priority(&self, pid: Pid) -> KResult<u16> {
        let inner = self.inner.lock();
        if !inner.pcb(pid)?.is_alive() {
            return Err(KernError::NoSuchProcess);
        }
        Ok(inner.pcbs[pid as usize].priority)
    }

    pub fn set_priority(&self, pid: Pid, priority: u16) -> KResult<()> {
        if priority > PRIORITY_LOWEST {
            return Err(KernError::InvalidArg);
        }
        let mut inner = self.inner.lock();
        if !inner.pcb(pid)?.is_alive() {
            return Err(KernError::NoSuchProcess);
        }
        let cur = inner.current;
        if pid != cur {
            let caller = &inner.pcbs[cur as usize];
            let target = &inner.pcbs[pid as usize];
            let allowed = caller.mode == ProcMode::Kernel
                || caller
                    .user
                    .as_ref()
                    .map_or(false, |u| u.caps.contains(Caps::SCHED))
                || match (&caller.user, &target.user) {
                    (Some(a), Some(b)) => a.uid == b.uid,
                    _ => false,
                };
            if !allowed {
                return Err(KernError::PermissionDenied);
            }
        }
        inner.pcbs[pid as usize].priority = priority;
        let main = inner.pcbs[pid as usize].main_task;
        if let Some(tid) = main {
            if let Some(task) = inner.tasks.get_mut(&tid) {
                task.priority = priority;
            }
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Every pid currently in use, ascending.
    pub fn used_pids(&self) -> Vec<Pid> {
        let inner = self.inner.lock();
        inner.pcbs.iter().filter(|p| !p.is_unused()).map(|p| p.pid).collect()
    }

    /// Mark a process as having replaced its image; its parent may no
    /// longer move it between groups.
    pub fn note_exec(&self, pid: Pid, name: &str) -> KResult<()> {
        let mut inner = self.inner.lock();
        if !inner.pcb(pid)?.is_alive() {
            return Err(KernError::NoSuchProcess);
        }
        let pcb = &mut inner.pcbs[pid as usize];
        pcb.status.insert(ProcessStatus::ALREADY_EXEC);
        pcb.name = name.to_string();
        Ok(())
    }

    pub fn process_status(&self, pid: Pid) -> Option<ProcessStatus> {
        let inner = self.inner.lock();
        inner.pcbs.get(pid as usize).map(|p| p.status)
    }

    pub fn process_name(&self, pid: Pid) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .pcbs
            .get(pid as usize)
            .filter(|p| !p.is_unused())
            .map(|p| p.name.clone())
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.inner.lock().pcbs.get(pid as usize).and_then(|p| p.parent)
    }

    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        let inner = self.inner.lock();
        inner
            .pcbs
            .get(pid as usize)
            .map(|p| p.children.clone())
            .unwrap_or_default()
    }

    pub fn main_task_of(&self, pid: Pid) -> Option<TaskId> {
        self.inner.lock().pcbs.get(pid as usize).and_then(|p| p.main_task)
    }

    pub fn group_members(&self, gid: Pid) -> Option<(Vec<Pid>, Vec<Pid>)> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&gid)
            .map(|g| (g.members.clone(), g.exit_members.clone()))
    }

    /// Pending signals delivered to `pid`, drained.
    pub fn take_pending(&self, pid: Pid) -> Vec<Siginfo> {
        let mut inner = self.inner.lock();
        inner
            .pcbs
            .get_mut(pid as usize)
            .map(|p| core::mem::take(&mut p.pending))
            .unwrap_or_default()
    }

    pub fn free_pcb_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn space_of(&self, pid: Pid) -> Option<Arc<VmSpace>> {
        self.inner.lock().pcbs.get(pid as usize).and_then(|p| p.space.clone())
    }

    pub fn memory_env(&self) -> Arc<MemoryEnv> {
        self.env.clone()
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        // Tear down every space still attached to a PCB, init's included,
        // so long-lived managers do not leave pages or registry entries
        // behind. The kernel space deregisters itself when its last
        // handle drops.
        let spaces: Vec<Arc<VmSpace>> = {
            let mut inner = self.inner.lock();
            inner.pcbs.iter_mut().filter_map(|p| p.space.take()).collect()
        };
        for space in spaces {
            if !space.is_kernel() && Arc::strong_count(&space) == 1 {
                let _ = space.free();
            }
        }
        let _ = self.vmalloc_space.free();
        if !self.inner.lock().recycle.is_empty() {
            log_warn!("proc: manager dropped with unrecycled processes");
        }
    }
}
