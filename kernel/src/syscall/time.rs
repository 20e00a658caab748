//! Sleeping.
//!
//! `nanosleep` computes the target jiffy from HZ = 100, queues a timer
//! event, blocks, and yields. A task woken by a signal instead of the
//! timer reports the remaining duration; a natural wake-up completes
//! cleanly. The two halves of the state machine meet in the task's
//! pending slot.

use crate::error::{KernelError, KernelResult};
use crate::sched::PendingOp;
use crate::state::KernelState;
use crate::timer::{duration_to_jiffies, jiffies_to_duration};

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The requested time elapsed
    Completed,
    /// A signal cut the sleep short with this much time left
    Interrupted { rem_sec: u64, rem_nsec: u64 },
}

/// Sleep for `sec` seconds plus `nsec` nanoseconds.
///
/// The first invocation queues the wake-up and parks the task behind
/// `WouldBlock`; the dispatcher re-invokes after wake-up and the second
/// half returns the outcome.
pub fn sys_nanosleep(
    state: &KernelState,
    cpu: usize,
    sec: u64,
    nsec: u64,
) -> KernelResult<SleepOutcome> {
    let mut tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let task = tasks.task_mut(tid).ok_or(KernelError::NotFound)?;
    let pid = task.proc.ok_or(KernelError::Invalid)?;

    if let Some(PendingOp::Sleep { fire }) = task.pending {
        // Second half: the task was woken.
        task.pending = None;
        if task.signaled {
            task.signaled = false;
            drop(tasks);
            state.timers.lock().cancel(pid);
            let remaining = fire.saturating_sub(state.now());
            let (rem_sec, rem_nsec) = jiffies_to_duration(remaining);
            return Ok(SleepOutcome::Interrupted { rem_sec, rem_nsec });
        }
        return Ok(SleepOutcome::Completed);
    }

    // First half: queue the wake-up and park.
    let fire = state.now() + duration_to_jiffies(sec, nsec);
    task.state = crate::sched::TaskState::Blocked;
    task.pending = Some(PendingOp::Sleep { fire });
    task.signaled = false;
    drop(tasks);
    state.timers.lock().insert(fire, pid);
    Err(KernelError::WouldBlock)
}
