//! The kernel variables record.
//!
//! One record holds every piece of process-wide mutable state: the
//! memory managers, the slab allocator, the task manager and run queue,
//! the timer list, the process table, the filesystem registries, the
//! syscall table, the jiffy counter, and the console list. The BSP
//! initializes it exactly once; afterwards it is only reached through
//! shared references, with each subsystem guarding itself with its own
//! spin lock.
//!
//! Lock order, outermost first: `mm` → `slab` → `procs` → `tasks` →
//! `timers`. Devfs entry locks and the console list lock are leaves.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::drivers::console::ConsoleList;
use crate::error::{KernelError, KernelResult};
use crate::fs::devfs::Devfs;
use crate::fs::initramfs::Initramfs;
use crate::fs::Vfs;
use crate::mm::kmalloc;
use crate::mm::slab::SlabAllocator;
use crate::mm::vmm::Memory;
use crate::process::ProcessTable;
use crate::sched::{TaskId, TaskManager, KSTACK_SIZE};
use crate::sync::OnceLock;
use crate::syscall::SyscallTable;
use crate::timer::TimerList;

/// Slab cache backing kernel stacks.
pub const SLAB_KSTACK: &str = "kstack";

/// Kernel-wide state.
pub struct KernelState {
    /// Physical allocator + kernel address space + arch interface
    pub mm: Mutex<Memory>,
    /// Slab allocator
    pub slab: Mutex<SlabAllocator>,
    /// Task arena and run queue
    pub tasks: Mutex<TaskManager>,
    /// Pending wake-ups
    pub timers: Mutex<TimerList>,
    /// Process table, pids 1..=65536
    pub procs: Mutex<ProcessTable>,
    /// Filesystem module registry and mounts
    pub vfs: Mutex<Vfs>,
    /// Device filesystem
    pub devfs: Arc<Devfs>,
    /// Boot image filesystem, once loaded
    pub initramfs: Mutex<Option<Arc<Initramfs>>>,
    /// Syscall dispatch table
    pub syscalls: SyscallTable,
    /// Tick counter, bumped by CPU 0
    pub jiffies: AtomicU64,
    /// Console writer list
    pub consoles: ConsoleList,
}

static KERNEL: OnceLock<KernelState> = OnceLock::new();

impl KernelState {
    /// Build the record around an initialized memory manager and wire up
    /// the allocator stack and filesystem registries.
    pub fn bootstrap(mem: Memory) -> KernelResult<Self> {
        let state = Self {
            mm: Mutex::new(mem),
            slab: Mutex::new(SlabAllocator::new()),
            tasks: Mutex::new(TaskManager::new()),
            timers: Mutex::new(TimerList::new()),
            procs: Mutex::new(ProcessTable::new()),
            vfs: Mutex::new(Vfs::new()),
            devfs: Arc::new(Devfs::new()),
            initramfs: Mutex::new(None),
            syscalls: SyscallTable::with_core_handlers(),
            jiffies: AtomicU64::new(0),
            consoles: ConsoleList::new(),
        };

        {
            let mut slab = state.slab.lock();
            kmalloc::init(&mut slab)?;
            slab.create_cache(SLAB_KSTACK, KSTACK_SIZE)?;
        }
        {
            let mut vfs = state.vfs.lock();
            vfs.register(state.devfs.clone())?;
            vfs.mount("devfs", "/dev")?;
        }
        Ok(state)
    }

    /// Attach the boot image and mount it at the root.
    pub fn load_initramfs(&self, image: &'static [u8]) -> KernelResult<()> {
        let fs = Arc::new(Initramfs::new(image)?);
        let mut vfs = self.vfs.lock();
        vfs.register(fs.clone())?;
        vfs.mount("initramfs", "/")?;
        *self.initramfs.lock() = Some(fs);
        Ok(())
    }

    /// Allocate `size` bytes through the fixed-class allocator.
    pub fn kmalloc(&self, size: usize) -> KernelResult<u64> {
        let mut mm = self.mm.lock();
        let mut slab = self.slab.lock();
        kmalloc::kmalloc(&mut slab, &mut *mm, size)
    }

    /// Return a [`Self::kmalloc`] allocation.
    pub fn kfree(&self, ptr: u64) -> KernelResult<()> {
        let mut slab = self.slab.lock();
        kmalloc::kfree(&mut slab, ptr)
    }

    /// Allocate a task with a slab-backed kernel stack.
    pub fn task_alloc(&self) -> KernelResult<TaskId> {
        let kstack = {
            let mut mm = self.mm.lock();
            let mut slab = self.slab.lock();
            slab.alloc(&mut *mm, SLAB_KSTACK)?
        };
        let mut tasks = self.tasks.lock();
        let id = tasks.alloc();
        if let Some(task) = tasks.task_mut(id) {
            task.kstack = kstack;
        }
        Ok(id)
    }

    /// Current jiffy count.
    pub fn now(&self) -> u64 {
        self.jiffies.load(Ordering::Relaxed)
    }

    /// One timer tick on `cpu`.
    ///
    /// CPU 0 advances the jiffy counter; every CPU then expires due
    /// timer events and runs a scheduler step. Returns the task that
    /// should run next on this CPU.
    pub fn tick(&self, cpu: usize) -> Option<TaskId> {
        if cpu == 0 {
            self.jiffies.fetch_add(1, Ordering::Relaxed);
        }
        let now = self.now();

        let procs = self.procs.lock();
        let mut tasks = self.tasks.lock();
        let mut timers = self.timers.lock();
        for pid in timers.expire(now) {
            if let Ok(proc) = procs.get(pid) {
                let _ = tasks.wake(proc.task);
            }
        }
        drop(timers);
        drop(procs);

        tasks.schedule(cpu)
    }

    /// The task currently running on `cpu`.
    pub fn current_task(&self, cpu: usize) -> KernelResult<TaskId> {
        self.tasks
            .lock()
            .current(cpu)
            .ok_or(KernelError::NotFound)
    }
}

/// Publish the kernel state; only the BSP calls this, once.
pub fn init_kernel(state: KernelState) -> KernelResult<&'static KernelState> {
    KERNEL.set(state).map_err(|_| KernelError::Exists)?;
    Ok(KERNEL.get().expect("kernel state just set"))
}

/// The kernel state. Panics before initialization.
pub fn kernel() -> &'static KernelState {
    KERNEL.get().expect("kernel state not initialized")
}

/// The kernel state, if the BSP has published it yet.
pub fn try_kernel() -> Option<&'static KernelState> {
    KERNEL.get()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::arch::mock::MockArchOps;
    use crate::arch::MemoryArchOps;
    use crate::mm::frame_allocator::PhysMemory;
    use crate::mm::Zone;

    /// A fully wired kernel state over the mock architecture, with a
    /// kernel block and host-backed physical zones.
    pub fn fresh_state() -> KernelState {
        let ifs = MockArchOps::leaked();
        let mut phys = PhysMemory::new(0, 1);
        phys.add_region(Zone::Kernel, 0, 0x0100_0000, 0x0400_0000)
            .unwrap();
        phys.add_region(Zone::NumaAware, 0, 0x0400_0000, 0x4000_0000)
            .unwrap();
        let space = ifs.new_space().unwrap();
        let mut mem = Memory::with_pool_slots(phys, space, ifs, 4096);
        mem.block_add(0xFFFF_0000_0000, 0xFFFF_3FFF_FFFF).unwrap();
        KernelState::bootstrap(mem).unwrap()
    }
}
