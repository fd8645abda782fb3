//! End-to-end process lifecycle scenarios: fork, exit, the waitpid
//! family, groups and resource recycling against real address spaces.

use procvm::error::KernError;
use procvm::process::wait::{WaitOptions, CLD_EXITED, CLD_KILLED, SIGCHLD};
use procvm::process::{
    CloneFlags, ProcessManager, ProcessStatus, WaitOutcome, PID_IDLE, PID_INIT, PID_KERNEL,
};
use procvm::vm::{MemoryEnv, RegionBacking, RegionFlags};

fn setup() -> (std::sync::Arc<MemoryEnv>, ProcessManager) {
    let env = MemoryEnv::new(0x100_0000, 256);
    let mgr = ProcessManager::new(env.clone()).unwrap();
    // Give init a mapped page so user forks have something to clone.
    let space = mgr.space_of(PID_INIT).unwrap();
    let flags = RegionFlags::READ | RegionFlags::WRITE | RegionFlags::USER;
    let base = space.region_alloc(0, 0x1000, flags, RegionBacking::Anon).unwrap();
    let page = env.phys.lock().alloc().unwrap();
    space.map_page_at(base, page).unwrap();
    mgr.set_current(PID_INIT).unwrap();
    (env, mgr)
}

fn fork_child(mgr: &ProcessManager, name: &str) -> u32 {
    mgr.fork(CloneFlags::empty(), name, 0x1000, 0).unwrap()
}

fn collected(outcome: WaitOutcome) -> procvm::process::WaitReport {
    match outcome {
        WaitOutcome::Collected(report) => report,
        WaitOutcome::Blocked => panic!("wait unexpectedly blocked"),
    }
}

#[test]
fn fork_exit_wait_roundtrip() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "worker");
    assert_eq!(mgr.parent_of(child), Some(PID_INIT));
    assert_eq!(mgr.get_process_group(child), Ok(PID_INIT));

    mgr.natural_exit(child, 7).unwrap();
    assert!(mgr.process_status(child).unwrap().contains(ProcessStatus::ZOMBIE));

    let free_before = mgr.free_pcb_count();
    let report = collected(mgr.wait(child as i32, 0).unwrap());
    assert_eq!(report.pid, child);
    assert_eq!(report.status >> 8, 7);
    assert_eq!(report.info.signo, SIGCHLD as i32);
    assert_eq!(report.info.code, CLD_EXITED);
    assert_eq!(report.info.status, 7);
    // The PCB went back to the free list.
    assert_eq!(mgr.free_pcb_count(), free_before + 1);
    assert!(mgr.process_status(child).unwrap().contains(ProcessStatus::UNUSED));
    // A pid can only be collected once.
    assert_eq!(mgr.wait(child as i32, 0), Err(KernError::NoSuchChild));
}

#[test]
fn exited_children_are_collected_oldest_first() {
    let (_env, mgr) = setup();
    let a = fork_child(&mgr, "a");
    let b = fork_child(&mgr, "b");
    mgr.natural_exit(b, 5).unwrap();
    mgr.natural_exit(a, 0).unwrap();

    let first = collected(mgr.wait(-1, 0).unwrap());
    assert_eq!((first.pid, first.status >> 8), (b, 5));
    let second = collected(mgr.wait(-1, 0).unwrap());
    assert_eq!((second.pid, second.status >> 8), (a, 0));
    assert_eq!(mgr.wait(-1, 0), Err(KernError::NoSuchChild));
}

#[test]
fn wait_any_and_wnohang() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "a");
    // Alive child, WNOHANG: nothing to reap yet.
    assert_eq!(
        mgr.wait(-1, WaitOptions::WNOHANG.bits()),
        Err(KernError::WouldBlock)
    );
    mgr.natural_exit(child, 0).unwrap();
    let report = collected(mgr.wait(-1, 0).unwrap());
    assert_eq!(report.pid, child);
    // No more children at all now.
    assert_eq!(mgr.wait(-1, 0), Err(KernError::NoSuchChild));
}

#[test]
fn wait_by_group_matches_own_and_explicit_gid() {
    let (_env, mgr) = setup();
    let leader = fork_child(&mgr, "leader");
    let member = fork_child(&mgr, "member");
    mgr.set_process_group(leader, leader).unwrap();
    mgr.set_process_group(member, leader).unwrap();

    // pid 0 means the caller's own group; both children left it.
    mgr.natural_exit(member, 3).unwrap();
    assert_eq!(mgr.wait(0, WaitOptions::WNOHANG.bits()), Err(KernError::NoSuchChild));

    let report = collected(mgr.wait(-(leader as i32), 0).unwrap());
    assert_eq!(report.pid, member);
    assert_eq!(report.status >> 8, 3);
}

#[test]
fn blocked_wait_is_woken_by_child_exit() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "slow");
    let outcome = mgr.wait(child as i32, 0).unwrap();
    assert!(matches!(outcome, WaitOutcome::Blocked));
    assert!(mgr.process_status(PID_INIT).unwrap().contains(ProcessStatus::PENDING));

    let waiter = mgr.main_task_of(PID_INIT).unwrap();
    // Not woken yet.
    assert_eq!(mgr.wait_resume(waiter), Err(KernError::WouldBlock));

    mgr.natural_exit(child, 11).unwrap();
    let report = mgr.wait_resume(waiter).unwrap();
    assert_eq!(report.pid, child);
    assert_eq!(report.status >> 8, 11);
    assert!(!mgr.process_status(PID_INIT).unwrap().contains(ProcessStatus::PENDING));
}

#[test]
fn cancelled_wait_resumes_interrupted() {
    let (_env, mgr) = setup();
    let _child = fork_child(&mgr, "slow");
    assert!(matches!(mgr.wait(-1, 0).unwrap(), WaitOutcome::Blocked));
    let waiter = mgr.main_task_of(PID_INIT).unwrap();
    mgr.wait_cancel(waiter).unwrap();
    assert_eq!(mgr.wait_resume(waiter), Err(KernError::Interrupted));
}

#[test]
fn kill_signal_is_reported_and_not_overwritten() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "victim");
    mgr.kill(child, 9).unwrap();
    let report = collected(mgr.wait(child as i32, 0).unwrap());
    assert_eq!(report.status & 0x7f, 9);
    assert_eq!(report.info.code, CLD_KILLED);
    assert_eq!(report.info.status, 9);
}

#[test]
fn kill_refuses_root_processes() {
    let (_env, mgr) = setup();
    for root in [PID_IDLE, PID_INIT, PID_KERNEL] {
        assert_eq!(mgr.kill(root, 9), Err(KernError::PermissionDenied));
    }
    assert!(mgr.process_status(PID_INIT).unwrap().contains(ProcessStatus::RUNNING));
    assert!(mgr.process_status(PID_KERNEL).unwrap().contains(ProcessStatus::READY));
}

#[test]
fn parked_group_waiter_fails_once_children_are_gone() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "drifter");
    // Wait on init's own group, which the child is about to leave.
    assert!(matches!(mgr.wait(0, 0).unwrap(), WaitOutcome::Blocked));
    let waiter = mgr.main_task_of(PID_INIT).unwrap();

    mgr.set_current(child).unwrap();
    mgr.set_process_group(child, child).unwrap();
    mgr.set_current(PID_INIT).unwrap();
    mgr.natural_exit(child, 0).unwrap();
    // The exit did not satisfy the group waiter.
    assert_eq!(mgr.wait_resume(waiter), Err(KernError::WouldBlock));

    // Reaping the last child through another wait fails the parked
    // waiter for good.
    let report = collected(mgr.wait(-1, 0).unwrap());
    assert_eq!(report.pid, child);
    assert_eq!(mgr.wait_resume(waiter), Err(KernError::NoSuchChild));
    assert!(!mgr.process_status(PID_INIT).unwrap().contains(ProcessStatus::PENDING));
}

#[test]
fn wait_options_are_validated() {
    let (_env, mgr) = setup();
    let _child = fork_child(&mgr, "a");
    assert_eq!(mgr.wait(-1, 0xdead_0000), Err(KernError::InvalidArg));
    assert_eq!(
        mgr.wait(-1, WaitOptions::WUNTRACED.bits()),
        Err(KernError::NotSupported)
    );
}

#[test]
fn waiting_for_a_non_child_fails() {
    let (_env, mgr) = setup();
    let _child = fork_child(&mgr, "a");
    // The kernel root is not init's child.
    assert_eq!(
        mgr.wait(PID_KERNEL as i32, 0),
        Err(KernError::NoSuchChild)
    );
}

#[test]
fn orphans_are_reparented_to_init() {
    let (_env, mgr) = setup();
    let parent = fork_child(&mgr, "middle");
    mgr.set_current(parent).unwrap();
    let grandchild = fork_child(&mgr, "leaf");
    mgr.set_current(PID_INIT).unwrap();

    mgr.natural_exit(parent, 0).unwrap();
    assert_eq!(mgr.parent_of(grandchild), Some(PID_INIT));
    assert!(mgr.children_of(PID_INIT).contains(&grandchild));
    let _ = collected(mgr.wait(parent as i32, 0).unwrap());
    // The inherited grandchild is still waitable.
    mgr.natural_exit(grandchild, 1).unwrap();
    let report = collected(mgr.wait(-1, 0).unwrap());
    assert_eq!(report.pid, grandchild);
}

#[test]
fn group_outlives_exited_leader_until_last_member_is_reaped() {
    let (_env, mgr) = setup();
    let leader = fork_child(&mgr, "leader");
    let member = fork_child(&mgr, "member");
    mgr.set_process_group(leader, leader).unwrap();
    mgr.set_process_group(member, leader).unwrap();
    let free_before = mgr.free_pcb_count();

    mgr.natural_exit(leader, 0).unwrap();
    let _ = collected(mgr.wait(leader as i32, 0).unwrap());
    // The reaped leader still anchors the group for its member.
    assert_eq!(mgr.get_process_group(member), Ok(leader));
    let (members, exited) = mgr.group_members(leader).unwrap();
    assert_eq!(members, [member]);
    assert!(exited.is_empty());
    assert_eq!(mgr.free_pcb_count(), free_before);

    mgr.natural_exit(member, 0).unwrap();
    let _ = collected(mgr.wait(member as i32, 0).unwrap());
    // Group gone, both PCBs recovered.
    assert!(mgr.group_members(leader).is_none());
    assert_eq!(mgr.free_pcb_count(), free_before + 2);
}

#[test]
fn setpgid_rules() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "a");
    let other = fork_child(&mgr, "b");

    // Joining a group that does not exist is refused.
    assert_eq!(mgr.set_process_group(child, 42), Err(KernError::PermissionDenied));
    // The kernel root's group is off limits.
    assert_eq!(
        mgr.set_process_group(child, PID_KERNEL),
        Err(KernError::PermissionDenied)
    );
    // A child that exec'd can no longer be moved by its parent.
    mgr.note_exec(other, "b2").unwrap();
    assert_eq!(mgr.set_process_group(other, other), Err(KernError::PermissionDenied));

    // Moving a plain child into its own fresh group works and is
    // visible through the group table.
    mgr.set_process_group(child, child).unwrap();
    assert_eq!(mgr.get_process_group(child), Ok(child));
    assert!(mgr
        .process_status(child)
        .unwrap()
        .contains(ProcessStatus::GROUP_LEADER));

    // Only self or children may be targeted.
    mgr.set_current(child).unwrap();
    assert_eq!(mgr.set_process_group(other, child), Err(KernError::PermissionDenied));
}

#[test]
fn setpgid_requires_a_family_adjacent_leader() {
    let (_env, mgr) = setup();
    let a = fork_child(&mgr, "a");
    let b = fork_child(&mgr, "b");
    mgr.set_process_group(b, b).unwrap();

    mgr.set_current(a).unwrap();
    let c = fork_child(&mgr, "c");
    let d = fork_child(&mgr, "d");
    // A group living in another branch of the tree is out of reach.
    assert_eq!(mgr.set_process_group(c, b), Err(KernError::PermissionDenied));

    // A group led by the child's own parent is reachable.
    mgr.set_process_group(a, a).unwrap();
    mgr.set_process_group(c, a).unwrap();
    assert_eq!(mgr.get_process_group(c), Ok(a));

    // So is one led by a sibling sharing the same parent.
    mgr.set_process_group(d, d).unwrap();
    mgr.set_process_group(c, d).unwrap();
    assert_eq!(mgr.get_process_group(c), Ok(d));
}

#[test]
fn cow_fork_and_recycle_release_pages() {
    let (env, mgr) = setup();
    let init_space = mgr.space_of(PID_INIT).unwrap();
    let used_before = env.phys.lock().used();

    let child = fork_child(&mgr, "cow");
    {
        let child_space = mgr.space_of(child).unwrap();
        assert!(!std::sync::Arc::ptr_eq(&init_space, &child_space));
    }
    // One new frame: the child's translation table. The data page is
    // shared copy-on-write.
    assert_eq!(env.phys.lock().used(), used_before + 1);

    mgr.natural_exit(child, 0).unwrap();
    mgr.recycle_to_free();
    let _ = collected(mgr.wait(child as i32, 0).unwrap());
    assert_eq!(env.phys.lock().used(), used_before);
    // The parent's mapping survived the child's teardown.
    let region = init_space.region_at(procvm::vm::space::USER_MAP_BASE).unwrap();
    assert!(init_space.query(region.base).is_some());
}

#[test]
fn clone_vm_shares_the_parent_space() {
    let (_env, mgr) = setup();
    let init_space = mgr.space_of(PID_INIT).unwrap();
    let child = mgr.fork(CloneFlags::VM, "thread-ish", 0x1000, 0).unwrap();
    let child_space = mgr.space_of(child).unwrap();
    assert!(std::sync::Arc::ptr_eq(&init_space, &child_space));
}

#[test]
fn signals_fan_out_to_groups_and_everyone() {
    let (_env, mgr) = setup();
    let a = fork_child(&mgr, "a");
    let b = fork_child(&mgr, "b");
    mgr.set_process_group(a, a).unwrap();
    mgr.set_process_group(b, a).unwrap();

    assert_eq!(mgr.send_signal_to_group(a, 15), Ok(2));
    assert_eq!(mgr.take_pending(a).len(), 1);
    assert_eq!(mgr.take_pending(b).len(), 1);

    let n = mgr.send_signal_to_all(15).unwrap();
    // Everyone alive except idle and the caller.
    assert!(n >= 3);
    assert!(mgr.take_pending(PID_KERNEL).iter().any(|s| s.signo == 15));
}

#[test]
fn priorities_respect_bounds_and_ownership() {
    let (_env, mgr) = setup();
    let child = fork_child(&mgr, "a");
    assert_eq!(mgr.set_priority(child, 99), Err(KernError::InvalidArg));
    mgr.set_priority(child, 5).unwrap();
    assert_eq!(mgr.get_priority(child), Ok(5));
}

#[test]
fn dropping_the_manager_unregisters_its_spaces() {
    let env = MemoryEnv::new(0x100_0000, 64);
    let ids = {
        let mgr = ProcessManager::new(env).unwrap();
        let init_id = mgr.space_of(PID_INIT).unwrap().id;
        [mgr.kernel_space.id, mgr.vmalloc_space.id, init_id]
    };
    let live = procvm::vm::space::live_spaces();
    for id in ids {
        assert!(!live.contains(&id), "space {} still registered", id);
    }
}

#[test]
fn used_pids_tracks_lifecycle() {
    let (_env, mgr) = setup();
    let mut pids = mgr.used_pids();
    pids.sort_unstable();
    assert_eq!(pids, vec![0, 1, 2]);
    let child = fork_child(&mgr, "a");
    assert!(mgr.used_pids().contains(&child));
    mgr.natural_exit(child, 0).unwrap();
    // Zombies still hold their pid.
    assert!(mgr.used_pids().contains(&child));
    let _ = collected(mgr.wait(child as i32, 0).unwrap());
    assert!(!mgr.used_pids().contains(&child));
}
