//! Processes: an address space plus a task and a descriptor table.

mod table;

pub use table::{ProcessTable, PROC_NR};

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::FileDescriptor;
use crate::mm::vas::VirtMemory;
use crate::mm::vmm::Memory;
use crate::sched::TaskId;

/// Process identifier; valid pids start at 1.
pub type Pid = i32;

/// Longest path or process name
pub const PATH_MAX: usize = 1024;

/// File descriptors per process
pub const FD_MAX: usize = 1024;

/// Where a user program image is loaded
pub const PROC_PROG_ADDR: u64 = 0x8000_0000;
/// Size of the program block
pub const PROC_PROG_SIZE: u64 = 0x4000_0000;

/// The program's code region within its address space.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeRegion {
    pub addr: u64,
    pub size: u64,
}

/// Per-process state.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub cwd: String,
    pub parent: Option<Pid>,
    /// The process's task (single-threaded processes)
    pub task: TaskId,
    /// File descriptor table
    pub fds: Vec<Option<Arc<FileDescriptor>>>,
    pub uid: u32,
    pub gid: u32,
    /// The process's address space
    pub vmem: VirtMemory,
    pub code: CodeRegion,
    pub exit_status: i32,
}

impl Process {
    /// Create a process around a fresh user address space with the
    /// program block added.
    pub fn new(pid: Pid, task: TaskId, mem: &Memory) -> KernelResult<Self> {
        let mut vmem = mem.new_user_space()?;
        vmem.block_add(mem.ifs(), PROC_PROG_ADDR, PROC_PROG_ADDR + PROC_PROG_SIZE - 1)?;
        Ok(Self::with_vmem(pid, task, vmem))
    }

    /// Create a process around an existing address space (fork path).
    pub fn with_vmem(pid: Pid, task: TaskId, vmem: VirtMemory) -> Self {
        let mut fds = Vec::with_capacity(FD_MAX);
        fds.resize_with(FD_MAX, || None);
        Self {
            pid,
            name: String::new(),
            cwd: String::from("/"),
            parent: None,
            task,
            fds,
            uid: 0,
            gid: 0,
            vmem,
            code: CodeRegion::default(),
            exit_status: 0,
        }
    }

    /// Install `fd` at the lowest free descriptor slot.
    pub fn fd_install(&mut self, fd: Arc<FileDescriptor>) -> KernelResult<usize> {
        let slot = self
            .fds
            .iter()
            .position(|f| f.is_none())
            .ok_or(KernelError::Busy)?;
        self.fds[slot] = Some(fd);
        Ok(slot)
    }

    /// Descriptor at `n`, if open.
    pub fn fd(&self, n: usize) -> KernelResult<Arc<FileDescriptor>> {
        self.fds
            .get(n)
            .and_then(|f| f.clone())
            .ok_or(KernelError::NotFound)
    }

    /// Close descriptor `n`.
    pub fn fd_close(&mut self, n: usize) -> KernelResult<()> {
        let slot = self.fds.get_mut(n).ok_or(KernelError::Invalid)?;
        slot.take().map(|_| ()).ok_or(KernelError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::MemoryArchOps;
    use crate::fs::{FdStorage, FileDescriptor};

    fn descriptor() -> Arc<FileDescriptor> {
        Arc::new(FileDescriptor::new(
            crate::fs::test_support::null_module(),
            FdStorage::default(),
        ))
    }

    #[test]
    fn fd_table_allocates_lowest_slot() {
        let vmem = {
            let ifs = crate::arch::mock::MockArchOps::leaked();
            let s = ifs.new_space().unwrap();
            VirtMemory::new(s, crate::mm::VmFlags::USER, 64)
        };
        let mut p = Process::with_vmem(1, TaskId(0), vmem);

        let a = p.fd_install(descriptor()).unwrap();
        let b = p.fd_install(descriptor()).unwrap();
        assert_eq!((a, b), (0, 1));

        p.fd_close(0).unwrap();
        let c = p.fd_install(descriptor()).unwrap();
        assert_eq!(c, 0, "lowest free slot reused");
        assert!(p.fd(1).is_ok());
        assert!(matches!(p.fd(3), Err(KernelError::NotFound)));
        assert_eq!(p.fd_close(0), Ok(()));
        assert_eq!(p.fd_close(0), Err(KernelError::NotFound));
    }
}
