//! System-call surface.
//!
//! A dispatch table indexed by syscall number holds the core handlers.
//! Argument pointers are validated to lie wholly inside an entry of the
//! caller's address space before the kernel touches them; failures map
//! onto negative return values.
//!
//! A handler that must wait (`read` on an empty device, `nanosleep`)
//! parks its task, records a [`crate::sched::PendingOp`], and reports
//! `WouldBlock`; the architecture's syscall entry yields and re-drives
//! the call after wake-up.

pub mod driver;
pub mod io;
pub mod process;
pub mod time;

extern crate alloc;

use crate::error::{KernelError, KernelResult};
use crate::state::KernelState;

/// Dispatch table capacity
pub const SYS_MAX: usize = 768;

/// Core syscall numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Execve = 59,
    Mmap = 197,
    Nanosleep = 240,
    Initexec = 764,
    Driver = 765,
}

/// Raw argument registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs(pub [u64; 6]);

impl SyscallArgs {
    pub fn arg(&self, i: usize) -> u64 {
        self.0[i]
    }
}

/// A syscall handler bound to the dispatch table.
pub type Handler = fn(&KernelState, usize, &SyscallArgs) -> KernelResult<u64>;

/// The dispatch table.
pub struct SyscallTable {
    handlers: [Option<Handler>; SYS_MAX],
}

impl SyscallTable {
    pub fn empty() -> Self {
        const NONE: Option<Handler> = None;
        Self {
            handlers: [NONE; SYS_MAX],
        }
    }

    /// The table with every core handler installed.
    pub fn with_core_handlers() -> Self {
        let mut t = Self::empty();
        t.set(Syscall::Exit as usize, h_exit);
        t.set(Syscall::Fork as usize, h_fork);
        t.set(Syscall::Read as usize, h_read);
        t.set(Syscall::Write as usize, h_write);
        t.set(Syscall::Open as usize, h_open);
        t.set(Syscall::Execve as usize, h_execve);
        t.set(Syscall::Mmap as usize, h_mmap);
        t.set(Syscall::Nanosleep as usize, h_nanosleep);
        t.set(Syscall::Initexec as usize, h_initexec);
        t.set(Syscall::Driver as usize, h_driver);
        t
    }

    pub fn set(&mut self, nr: usize, handler: Handler) {
        if nr < SYS_MAX {
            self.handlers[nr] = Some(handler);
        }
    }

    /// One dispatch attempt. `WouldBlock` bubbles up so the syscall
    /// entry can yield and retry.
    pub fn dispatch(
        &self,
        state: &KernelState,
        cpu: usize,
        nr: usize,
        args: &SyscallArgs,
    ) -> KernelResult<u64> {
        let handler = self
            .handlers
            .get(nr)
            .and_then(|h| *h)
            .ok_or(KernelError::Invalid)?;
        handler(state, cpu, args)
    }
}

/// Dispatch and fold the result into the user-visible convention:
/// non-negative on success, negative errno on failure.
pub fn dispatch_errno(state: &KernelState, cpu: usize, nr: usize, args: &SyscallArgs) -> i64 {
    match state.syscalls.dispatch(state, cpu, nr, args) {
        Ok(v) => v as i64,
        Err(e) => e.errno(),
    }
}

/// Validate that `[ptr, ptr + len)` lies wholly inside one entry of the
/// calling process's address space.
pub fn validate_user_range(
    state: &KernelState,
    cpu: usize,
    ptr: u64,
    len: u64,
) -> KernelResult<()> {
    let procs = state.procs.lock();
    let tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let pid = tasks
        .task(tid)
        .and_then(|t| t.proc)
        .ok_or(KernelError::Invalid)?;
    let proc = procs.get(pid)?;
    if proc.vmem.contains_range(ptr, len) {
        Ok(())
    } else {
        Err(KernelError::Invalid)
    }
}

/// Borrow a user buffer for writing after validation.
fn user_slice_mut(
    state: &KernelState,
    cpu: usize,
    ptr: u64,
    len: u64,
) -> KernelResult<&'static mut [u8]> {
    validate_user_range(state, cpu, ptr, len)?;
    // SAFETY: The range is page-backed inside the caller's address
    // space, the handler runs on the caller's page tables, and the
    // single-threaded caller cannot unmap it while its own syscall runs.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Borrow a user buffer for reading after validation.
fn user_slice(
    state: &KernelState,
    cpu: usize,
    ptr: u64,
    len: u64,
) -> KernelResult<&'static [u8]> {
    validate_user_range(state, cpu, ptr, len)?;
    // SAFETY: See `user_slice_mut`.
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

/// Copy a NUL-terminated user string of at most PATH_MAX bytes.
fn user_cstr(
    state: &KernelState,
    cpu: usize,
    ptr: u64,
) -> KernelResult<alloc::string::String> {
    let mut bytes = alloc::vec::Vec::new();
    for i in 0..crate::process::PATH_MAX as u64 {
        let b = user_slice(state, cpu, ptr + i, 1)?[0];
        if b == 0 {
            return alloc::string::String::from_utf8(bytes).map_err(|_| KernelError::Invalid);
        }
        bytes.push(b);
    }
    Err(KernelError::Invalid)
}

// ---------------------------------------------------------------------------
// Table handlers: marshalling around the typed implementations
// ---------------------------------------------------------------------------

fn h_exit(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    process::sys_exit(state, cpu, args.arg(0) as i32).map(|_| 0)
}

fn h_fork(state: &KernelState, cpu: usize, _args: &SyscallArgs) -> KernelResult<u64> {
    process::sys_fork(state, cpu).map(|pid| pid as u64)
}

fn h_read(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    let buf = user_slice_mut(state, cpu, args.arg(1), args.arg(2))?;
    io::sys_read(state, cpu, args.arg(0) as usize, buf)
}

fn h_write(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    let buf = user_slice(state, cpu, args.arg(1), args.arg(2))?;
    io::sys_write(state, cpu, args.arg(0) as usize, buf)
}

fn h_open(_state: &KernelState, _cpu: usize, _args: &SyscallArgs) -> KernelResult<u64> {
    io::sys_open()
}

fn h_execve(_state: &KernelState, _cpu: usize, _args: &SyscallArgs) -> KernelResult<u64> {
    process::sys_execve()
}

fn h_mmap(_state: &KernelState, _cpu: usize, _args: &SyscallArgs) -> KernelResult<u64> {
    io::sys_mmap()
}

fn h_nanosleep(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    let req = user_slice(state, cpu, args.arg(0), 16)?;
    let sec = i64::from_ne_bytes(req[0..8].try_into().expect("timespec layout")) as u64;
    let nsec = i64::from_ne_bytes(req[8..16].try_into().expect("timespec layout")) as u64;

    match time::sys_nanosleep(state, cpu, sec, nsec)? {
        time::SleepOutcome::Completed => Ok(0),
        time::SleepOutcome::Interrupted { rem_sec, rem_nsec } => {
            let rem_ptr = args.arg(1);
            if rem_ptr != 0 {
                let rem = user_slice_mut(state, cpu, rem_ptr, 16)?;
                rem[0..8].copy_from_slice(&(rem_sec as i64).to_ne_bytes());
                rem[8..16].copy_from_slice(&(rem_nsec as i64).to_ne_bytes());
            }
            Err(KernelError::Interrupted)
        }
    }
}

fn h_initexec(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    let path = user_cstr(state, cpu, args.arg(0))?;
    process::sys_initexec(state, cpu, &path).map(|_| 0)
}

fn h_driver(state: &KernelState, cpu: usize, args: &SyscallArgs) -> KernelResult<u64> {
    driver::sys_driver(state, cpu, args.arg(0) as usize, args)
}
