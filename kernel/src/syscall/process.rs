//! Process lifecycle syscalls: exit, fork, execve, initexec.

extern crate alloc;

use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::mm::vas::VirtMemory;
use crate::mm::Zone;
use crate::process::{Pid, Process, PROC_PROG_ADDR};
use crate::state::KernelState;

/// Terminate the calling task and record the exit status on its
/// process. The task stops being selected; the final context switch
/// happens at the dispatcher's yield.
pub fn sys_exit(state: &KernelState, cpu: usize, status: i32) -> KernelResult<()> {
    let mut procs = state.procs.lock();
    let mut tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let pid = tasks.task(tid).and_then(|t| t.proc);
    tasks.terminate_current(cpu)?;
    drop(tasks);
    if let Some(pid) = pid {
        if let Ok(proc) = procs.get_mut(pid) {
            proc.exit_status = status;
        }
        state.timers.lock().cancel(pid);
    }
    Ok(())
}

/// Create a child process whose address space is a copy-on-write clone
/// of the caller's.
///
/// Returns the child's pid to the parent; the architecture's fork glue
/// plants 0 in the child's return register.
pub fn sys_fork(state: &KernelState, cpu: usize) -> KernelResult<Pid> {
    // Identify the parent before taking any allocation locks.
    let parent_pid = {
        let tasks = state.tasks.lock();
        let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
        tasks
            .task(tid)
            .and_then(|t| t.proc)
            .ok_or(KernelError::Invalid)?
    };

    // The child task and its kernel stack come first so no other lock is
    // held across the slab allocation.
    let child_task = state.task_alloc()?;

    match fork_child(state, parent_pid, child_task) {
        Ok(pid) => Ok(pid),
        Err(e) => {
            // Unwind the half-built child.
            let kstack = {
                let mut tasks = state.tasks.lock();
                tasks.release(child_task).map(|t| t.kstack)
            };
            if let Some(kstack) = kstack.filter(|&k| k != 0) {
                let _ = state.slab.lock().free(crate::state::SLAB_KSTACK, kstack);
            }
            Err(e)
        }
    }
}

fn fork_child(state: &KernelState, parent_pid: Pid, child_task: crate::sched::TaskId) -> KernelResult<Pid> {
    let mut mm = state.mm.lock();
    let mut procs = state.procs.lock();
    let mut tasks = state.tasks.lock();

    let pid = procs.free_pid()?;
    let mut child_vmem = mm.new_user_space()?;
    {
        let parent = procs.get_mut(parent_pid)?;
        VirtMemory::fork(&mut child_vmem, &mut parent.vmem)?;
    }

    let mut child = Process::with_vmem(pid, child_task, child_vmem);
    {
        let parent = procs.get(parent_pid)?;
        child.name = parent.name.clone();
        child.cwd = parent.cwd.clone();
        child.uid = parent.uid;
        child.gid = parent.gid;
        child.code = parent.code;
        child.fds = parent.fds.clone();
    }
    child.parent = Some(parent_pid);

    if let Some(task) = tasks.task_mut(child_task) {
        task.proc = Some(pid);
    }
    procs.insert(child)?;
    tasks.enqueue(child_task)?;
    Ok(pid)
}

/// Reserved: a real execve needs the open and mmap paths.
pub fn sys_execve() -> KernelResult<u64> {
    Err(KernelError::Unsupported)
}

/// Replace the calling task's image with a file from the boot image.
///
/// The file is located by a linear scan of the flat directory, the
/// program range is populated in the caller's address space, and the
/// payload is copied to the fixed program address. The architecture
/// re-enters user mode at the program entry when the handler returns.
pub fn sys_initexec(state: &KernelState, cpu: usize, path: &str) -> KernelResult<()> {
    let initramfs = state
        .initramfs
        .lock()
        .clone()
        .ok_or(KernelError::NotFound)?;
    let file = initramfs.find(path)?;
    if file.directory {
        return Err(KernelError::Invalid);
    }

    let mut mm = state.mm.lock();
    let mut procs = state.procs.lock();
    let tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let pid = tasks
        .task(tid)
        .and_then(|t| t.proc)
        .ok_or(KernelError::Invalid)?;
    drop(tasks);

    let ifs = mm.ifs();
    let proc = procs.get_mut(pid)?;

    // Populate the program range unless a previous image left one.
    let npages = crate::mm::align_up(file.size.max(1), crate::mm::PAGE_SIZE)
        / crate::mm::PAGE_SIZE;
    if proc.vmem.entry_at(PROC_PROG_ADDR).is_none() {
        proc.vmem.alloc_pages_at(
            &mut mm.phys,
            ifs,
            PROC_PROG_ADDR,
            npages as usize,
            Zone::NumaAware,
            0,
        )?;
    }

    // Copy the payload into place through the architecture.
    let data = initramfs.contents(&file)?;
    ifs.copy(
        proc.vmem.space,
        PROC_PROG_ADDR,
        data.as_ptr() as u64,
        file.size,
    )?;

    proc.name = String::from(path);
    proc.code.addr = PROC_PROG_ADDR;
    proc.code.size = file.size;
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::sched::TaskState;
    use crate::state::test_support::fresh_state;
    use crate::state::KernelState;

    /// Spawn a process with a task and make it current on CPU 0.
    pub fn spawn_current(state: &KernelState, cpu: usize) -> (Pid, crate::sched::TaskId) {
        let task = state.task_alloc().unwrap();
        let pid = {
            let mm = state.mm.lock();
            let mut procs = state.procs.lock();
            let pid = procs.free_pid().unwrap();
            let proc = Process::new(pid, task, &mm).unwrap();
            procs.insert(proc).unwrap();
            pid
        };
        {
            let mut tasks = state.tasks.lock();
            tasks.task_mut(task).unwrap().proc = Some(pid);
            tasks.enqueue(task).unwrap();
        }
        state.tick(cpu);
        assert_eq!(state.current_task(cpu).unwrap(), task);
        (pid, task)
    }

    #[test]
    fn exit_terminates_and_records_status() {
        let state = fresh_state();
        let (pid, task) = spawn_current(&state, 0);

        sys_exit(&state, 0, 7).unwrap();
        assert_eq!(
            state.tasks.lock().task(task).unwrap().state,
            TaskState::Terminated
        );
        assert_eq!(state.procs.lock().get(pid).unwrap().exit_status, 7);

        // The task is never selected again.
        for _ in 0..30 {
            assert_ne!(state.tick(0), Some(task));
        }
    }

    #[test]
    fn fork_creates_cow_child() {
        let state = fresh_state();
        let (pid, _task) = spawn_current(&state, 0);

        let child_pid = sys_fork(&state, 0).unwrap();
        assert_ne!(child_pid, pid);

        let procs = state.procs.lock();
        let child = procs.get(child_pid).unwrap();
        assert_eq!(child.parent, Some(pid));

        // The child task is runnable and belongs to the child process.
        let tasks = state.tasks.lock();
        let ct = tasks.task(child.task).unwrap();
        assert_eq!(ct.proc, Some(child_pid));
        assert_eq!(ct.state, TaskState::Ready);
    }

    #[test]
    fn fork_without_process_fails() {
        let state = fresh_state();
        // An idle-style task with no process
        let task = state.task_alloc().unwrap();
        {
            let mut tasks = state.tasks.lock();
            tasks.enqueue(task).unwrap();
        }
        state.tick(0);
        assert_eq!(sys_fork(&state, 0).unwrap_err(), KernelError::Invalid);
    }

    #[test]
    fn initexec_loads_the_image() {
        let state = fresh_state();
        let image = crate::fs::initramfs::test_support::build_image(&[(
            "init",
            false,
            b"program-bytes",
        )]);
        state.load_initramfs(image).unwrap();
        let (pid, _task) = spawn_current(&state, 0);

        sys_initexec(&state, 0, "init").unwrap();
        let procs = state.procs.lock();
        let proc = procs.get(pid).unwrap();
        assert_eq!(proc.name, "init");
        assert_eq!(proc.code.addr, PROC_PROG_ADDR);
        assert_eq!(proc.code.size, 13);
        assert!(proc.vmem.entry_at(PROC_PROG_ADDR).is_some());

        assert_eq!(
            sys_initexec(&state, 0, "missing").unwrap_err(),
            KernelError::NotFound
        );
    }
}
