//! Cooperative round-robin scheduler.
//!
//! One run queue feeds every CPU; each CPU keeps its own current and
//! idle slots. Kernel code is non-preemptible: the scheduler runs only
//! at the timer tick, at explicit yields, and when a task blocks or
//! terminates. A task picked off the queue with spent credit gets the
//! fixed quantum back.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use super::task::{PendingOp, Task, TaskId, TaskState, DEFAULT_CREDIT};
use crate::arch::MAX_CPUS;
use crate::error::{KernelError, KernelResult};
use crate::process::Pid;

/// Task arena, run queue, and per-CPU slots; guarded by one spin lock at
/// the kernel state level.
pub struct TaskManager {
    tasks: Vec<Option<Task>>,
    run_queue: VecDeque<TaskId>,
    current: [Option<TaskId>; MAX_CPUS],
    idle: [Option<TaskId>; MAX_CPUS],
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            run_queue: VecDeque::new(),
            current: [None; MAX_CPUS],
            idle: [None; MAX_CPUS],
        }
    }

    /// Allocate a task in state Created.
    pub fn alloc(&mut self) -> TaskId {
        for (i, slot) in self.tasks.iter_mut().enumerate() {
            if slot.is_none() {
                let id = TaskId(i as u32);
                *slot = Some(Task::new(id));
                return id;
            }
        }
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Some(Task::new(id)));
        id
    }

    /// Drop a terminated task.
    pub fn release(&mut self, id: TaskId) -> Option<Task> {
        self.run_queue.retain(|&t| t != id);
        self.tasks.get_mut(id.0 as usize)?.take()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0 as usize)?.as_ref()
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0 as usize)?.as_mut()
    }

    /// Register `id` as the idle task for `cpu`. Idle tasks never enter
    /// the run queue.
    pub fn set_idle(&mut self, cpu: usize, id: TaskId) {
        self.idle[cpu] = Some(id);
    }

    pub fn current(&self, cpu: usize) -> Option<TaskId> {
        self.current[cpu]
    }

    /// The task currently running on `cpu`, treating a missing current
    /// slot as the idle task.
    pub fn running_task(&self, cpu: usize) -> Option<TaskId> {
        self.current[cpu].or(self.idle[cpu])
    }

    /// Put a task on the run queue in state Ready.
    pub fn enqueue(&mut self, id: TaskId) -> KernelResult<()> {
        let task = self.task_mut(id).ok_or(KernelError::NotFound)?;
        if task.state == TaskState::Terminated {
            return Err(KernelError::Invalid);
        }
        task.state = TaskState::Ready;
        if !self.run_queue.contains(&id) {
            self.run_queue.push_back(id);
        }
        Ok(())
    }

    /// Wake a blocked task: Ready plus a run-queue slot.
    pub fn wake(&mut self, id: TaskId) -> KernelResult<()> {
        self.enqueue(id)
    }

    /// Transition `id` to Blocked; `pending` describes what it resumes.
    pub fn block(&mut self, id: TaskId, pending: Option<PendingOp>) -> KernelResult<()> {
        let task = self.task_mut(id).ok_or(KernelError::NotFound)?;
        task.state = TaskState::Blocked;
        if pending.is_some() {
            task.pending = pending;
        }
        Ok(())
    }

    /// Transition the current task on `cpu` to Blocked with `pending`
    /// describing what it resumes.
    pub fn block_current(&mut self, cpu: usize, pending: PendingOp) -> KernelResult<()> {
        let id = self.current[cpu].ok_or(KernelError::NotFound)?;
        self.block(id, Some(pending))
    }

    /// One scheduler step for `cpu`.
    ///
    /// Decrements the current task's credit; when the quantum is spent
    /// or the task stopped running, picks the next Ready task round-robin
    /// (replenishing its credit) and falls back to the idle task when the
    /// queue is dry. Returns the task that should run next.
    pub fn schedule(&mut self, cpu: usize) -> Option<TaskId> {
        let mut keep_current = false;

        if let Some(cur) = self.current[cpu] {
            if let Some(task) = self.task_mut(cur) {
                if task.state == TaskState::Running {
                    task.credit -= 1;
                    if task.credit > 0 {
                        keep_current = true;
                    } else {
                        // Quantum spent: rotate to the back of the queue.
                        task.state = TaskState::Ready;
                    }
                }
            }
        }

        if keep_current {
            return self.current[cpu];
        }

        // Rotate the outgoing task if it is still runnable.
        if let Some(cur) = self.current[cpu] {
            let requeue = self
                .task(cur)
                .map(|t| t.state == TaskState::Ready)
                .unwrap_or(false);
            if requeue && !self.run_queue.contains(&cur) {
                self.run_queue.push_back(cur);
            }
        }

        // Round-robin: first Ready task wins; stale entries drop out.
        let next = loop {
            let Some(id) = self.run_queue.pop_front() else {
                break self.idle[cpu];
            };
            let Some(task) = self.task_mut(id) else {
                continue;
            };
            if task.runnable() {
                if task.credit <= 0 {
                    task.credit = DEFAULT_CREDIT;
                }
                break Some(id);
            }
        };

        if let Some(id) = next {
            if let Some(task) = self.task_mut(id) {
                task.state = TaskState::Running;
            }
        }
        let idle = self.idle[cpu];
        self.current[cpu] = next.filter(|&id| idle != Some(id));
        next
    }

    /// Mark the current task Terminated; it stops being selected.
    pub fn terminate_current(&mut self, cpu: usize) -> KernelResult<()> {
        let id = self.current[cpu].ok_or(KernelError::NotFound)?;
        let task = self.task_mut(id).ok_or(KernelError::NotFound)?;
        task.state = TaskState::Terminated;
        task.pending = None;
        Ok(())
    }

    /// Raise the signaled flag on every task of `pid` that is blocked,
    /// and make it Ready so the pending operation can observe the
    /// signal.
    pub fn signal_process(&mut self, pid: Pid) {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .flatten()
            .filter(|t| t.proc == Some(pid) && t.state == TaskState::Blocked)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Some(task) = self.task_mut(id) {
                task.signaled = true;
            }
            let _ = self.wake(id);
        }
    }

    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }
}

/// The global-run-queue lock alias used at the kernel state level.
pub type LockedTaskManager = Mutex<TaskManager>;

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(n: usize) -> (TaskManager, Vec<TaskId>) {
        let mut tm = TaskManager::new();
        let idle = tm.alloc();
        tm.set_idle(0, idle);
        let mut ids = Vec::new();
        for _ in 0..n {
            let id = tm.alloc();
            tm.enqueue(id).unwrap();
            ids.push(id);
        }
        (tm, ids)
    }

    #[test]
    fn round_robin_rotation() {
        let (mut tm, ids) = manager_with(2);

        let first = tm.schedule(0).unwrap();
        assert_eq!(first, ids[0]);
        assert_eq!(tm.task(first).unwrap().credit, DEFAULT_CREDIT);

        // Burn the quantum: the next pick must be the other task.
        for _ in 0..DEFAULT_CREDIT - 1 {
            assert_eq!(tm.schedule(0), Some(ids[0]));
        }
        assert_eq!(tm.schedule(0), Some(ids[1]));

        // And back again after its quantum.
        for _ in 0..DEFAULT_CREDIT {
            tm.schedule(0);
        }
        assert_eq!(tm.current(0), Some(ids[0]));
    }

    #[test]
    fn idle_task_when_queue_is_empty() {
        let mut tm = TaskManager::new();
        let idle = tm.alloc();
        tm.set_idle(0, idle);
        assert_eq!(tm.schedule(0), Some(idle));
        assert_eq!(tm.current(0), None, "idle is not a current task");
        assert_eq!(tm.running_task(0), Some(idle));
    }

    #[test]
    fn blocked_task_is_skipped_until_woken() {
        let (mut tm, ids) = manager_with(2);
        let running = tm.schedule(0).unwrap();
        assert_eq!(running, ids[0]);

        tm.block_current(0, PendingOp::Read { fd: 3 }).unwrap();
        assert_eq!(tm.schedule(0), Some(ids[1]));

        // Still blocked after the second task's quantum: run ids[1] again
        for _ in 0..DEFAULT_CREDIT {
            tm.schedule(0);
        }
        assert_eq!(tm.current(0), Some(ids[1]));

        tm.wake(ids[0]).unwrap();
        assert_eq!(tm.task(ids[0]).unwrap().state, TaskState::Ready);
        for _ in 0..DEFAULT_CREDIT {
            tm.schedule(0);
        }
        assert_eq!(tm.current(0), Some(ids[0]));
        assert_eq!(
            tm.task(ids[0]).unwrap().pending,
            Some(PendingOp::Read { fd: 3 })
        );
    }

    #[test]
    fn terminated_task_never_selected_again() {
        let (mut tm, ids) = manager_with(2);
        tm.schedule(0);
        tm.terminate_current(0).unwrap();
        assert_eq!(tm.schedule(0), Some(ids[1]));
        for _ in 0..4 * DEFAULT_CREDIT {
            let picked = tm.schedule(0).unwrap();
            assert_ne!(picked, ids[0]);
        }
    }

    #[test]
    fn signal_wakes_blocked_process_task() {
        let (mut tm, ids) = manager_with(1);
        tm.task_mut(ids[0]).unwrap().proc = Some(7);
        tm.schedule(0);
        tm.block_current(0, PendingOp::Sleep { fire: 100 }).unwrap();

        tm.signal_process(7);
        let t = tm.task(ids[0]).unwrap();
        assert_eq!(t.state, TaskState::Ready);
        assert!(t.signaled);
    }

    #[test]
    fn release_purges_run_queue() {
        let (mut tm, ids) = manager_with(2);
        tm.release(ids[0]).unwrap();
        assert_eq!(tm.run_queue_len(), 1);
        assert!(tm.task(ids[0]).is_none());
        assert_eq!(tm.schedule(0), Some(ids[1]));
    }
}
