//! The process table.

extern crate alloc;

use alloc::collections::BTreeMap;

use super::{Pid, Process};
use crate::error::{KernelError, KernelResult};

/// Process table capacity; pids run 1..=PROC_NR.
pub const PROC_NR: usize = 65536;

/// Active processes indexed by pid.
#[derive(Default)]
pub struct ProcessTable {
    procs: BTreeMap<Pid, Process>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
        }
    }

    /// Lowest unused pid.
    pub fn free_pid(&self) -> KernelResult<Pid> {
        (1..=PROC_NR as Pid)
            .find(|pid| !self.procs.contains_key(pid))
            .ok_or(KernelError::Busy)
    }

    /// Insert a process under its pid.
    pub fn insert(&mut self, proc: Process) -> KernelResult<()> {
        if proc.pid < 1 || proc.pid > PROC_NR as Pid {
            return Err(KernelError::Invalid);
        }
        if self.procs.contains_key(&proc.pid) {
            return Err(KernelError::Exists);
        }
        self.procs.insert(proc.pid, proc);
        Ok(())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.procs.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> KernelResult<&Process> {
        self.procs.get(&pid).ok_or(KernelError::NotFound)
    }

    pub fn get_mut(&mut self, pid: Pid) -> KernelResult<&mut Process> {
        self.procs.get_mut(&pid).ok_or(KernelError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pid, &Process)> {
        self.procs.iter()
    }
}
