//! Tasks: the schedulable unit.
//!
//! A task carries its architecture frame pointer, its kernel stack, a
//! credit counter for round-robin accounting, and a signaled flag that
//! cuts sleeps short. The owning process is a back-reference by pid; a
//! task without a process is a kernel task (idle).

use crate::process::Pid;

/// Kernel stack bytes per task
pub const KSTACK_SIZE: usize = 8192;

/// Quantum in ticks handed to a task when the scheduler picks it up
pub const DEFAULT_CREDIT: i32 = 10;

/// Handle to a task in the task manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u32);

/// Task states.
///
/// At any instant a task is reachable from at most one of: the run
/// queue, a descriptor's blocked list, the timer list's owning process,
/// or nothing at all (Terminated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// The operation a blocked task resumes after wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// Sleeping until the target jiffy
    Sleep { fire: u64 },
    /// Waiting for data on a file descriptor
    Read { fd: usize },
}

/// Task control block.
#[derive(Debug)]
pub struct Task {
    /// Handle of this task
    pub id: TaskId,
    /// Owning process, if any
    pub proc: Option<Pid>,
    /// Kernel stack base (from the `kstack` slab cache); 0 for tasks
    /// that run on the boot stack
    pub kstack: u64,
    /// Opaque architecture frame pointer
    pub arch_frame: u64,
    /// Current state
    pub state: TaskState,
    /// Remaining quantum
    pub credit: i32,
    /// A signal cut the current wait short
    pub signaled: bool,
    /// Operation to resume after wake-up
    pub pending: Option<PendingOp>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            proc: None,
            kstack: 0,
            arch_frame: 0,
            state: TaskState::Created,
            credit: 0,
            signaled: false,
            pending: None,
        }
    }

    /// Is this task eligible for the run queue?
    pub fn runnable(&self) -> bool {
        matches!(self.state, TaskState::Created | TaskState::Ready)
    }
}
