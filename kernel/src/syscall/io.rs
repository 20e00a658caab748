//! File-descriptor syscalls.
//!
//! `read` and `write` delegate to the filesystem module behind the
//! descriptor. A read that finds no data parks the caller on the
//! descriptor and reports `WouldBlock`; the dispatcher retries it after
//! the driver's next push. `open` and `mmap` are reserved in the core.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::fs::FileDescriptor;
use crate::process::Pid;
use crate::sched::{PendingOp, TaskId};
use crate::state::KernelState;

/// Resolve the calling task and one of its descriptors.
fn current_fd(
    state: &KernelState,
    cpu: usize,
    fdn: usize,
) -> KernelResult<(TaskId, Pid, Arc<FileDescriptor>)> {
    let procs = state.procs.lock();
    let tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let pid = tasks
        .task(tid)
        .and_then(|t| t.proc)
        .ok_or(KernelError::Invalid)?;
    let fd = procs.get(pid)?.fd(fdn)?;
    Ok((tid, pid, fd))
}

/// Read from a descriptor into `buf`.
pub fn sys_read(
    state: &KernelState,
    cpu: usize,
    fdn: usize,
    buf: &mut [u8],
) -> KernelResult<u64> {
    let (tid, _, fd) = current_fd(state, cpu, fdn)?;
    let mut tasks = state.tasks.lock();
    match fd.read(&mut tasks, tid, buf) {
        Ok(n) => {
            if let Some(task) = tasks.task_mut(tid) {
                task.pending = None;
            }
            Ok(n as u64)
        }
        Err(KernelError::WouldBlock) => {
            if let Some(task) = tasks.task_mut(tid) {
                task.pending = Some(PendingOp::Read { fd: fdn });
            }
            Err(KernelError::WouldBlock)
        }
        Err(e) => Err(e),
    }
}

/// Write `buf` through a descriptor.
pub fn sys_write(
    state: &KernelState,
    cpu: usize,
    fdn: usize,
    buf: &[u8],
) -> KernelResult<u64> {
    let (tid, _, fd) = current_fd(state, cpu, fdn)?;
    let mut tasks = state.tasks.lock();
    fd.write(&mut tasks, tid, buf).map(|n| n as u64)
}

/// Reserved: the open path is outside the core.
pub fn sys_open() -> KernelResult<u64> {
    Err(KernelError::Unsupported)
}

/// Reserved: mmap is outside the core.
pub fn sys_mmap() -> KernelResult<u64> {
    Err(KernelError::Unsupported)
}

/// Kernel-internal open: resolve `path` through the VFS and install the
/// descriptor in `pid`'s table. Drivers and boot code use this; the user
/// syscall stays reserved.
pub fn open_path(state: &KernelState, pid: Pid, path: &str) -> KernelResult<usize> {
    let fd = state.vfs.lock().open(path, 0)?;
    let mut procs = state.procs.lock();
    procs.get_mut(pid)?.fd_install(fd)
}
