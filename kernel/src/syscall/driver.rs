//! Driver-only syscall surface.
//!
//! Sub-operations mirror the driver ABI: message hand-off to devfs,
//! mapping a physical region into the caller's space, device
//! registration, and raw port IO.

extern crate alloc;

use crate::error::{KernelError, KernelResult};
use crate::fs::devfs::{CharDevice, Device};
use crate::ipc::Message;
use crate::mm::{page_aligned, PAGE_SIZE};
use crate::process::Pid;
use crate::sched::TaskId;
use crate::state::KernelState;
use crate::syscall::SyscallArgs;

/// Message hand-off
pub const DRIVER_MSG: usize = 1;
/// Map a physical region into the caller's space
pub const DRIVER_MMAP: usize = 11;
/// Unmap a driver mapping
pub const DRIVER_MUNMAP: usize = 12;
/// Register a devfs entry
pub const DRIVER_REG_DEV: usize = 21;
pub const DRIVER_IN8: usize = 101;
pub const DRIVER_IN16: usize = 102;
pub const DRIVER_IN32: usize = 103;
pub const DRIVER_OUT8: usize = 111;
pub const DRIVER_OUT16: usize = 112;
pub const DRIVER_OUT32: usize = 113;

/// Message sub-operations
pub const DRIVER_MSG_PUTC: usize = 0;
pub const DRIVER_MSG_GETC: usize = 1;
pub const DRIVER_MSG_WRITE: usize = 3;

/// The calling driver's task and process.
fn caller(state: &KernelState, cpu: usize) -> KernelResult<(TaskId, Pid)> {
    let tasks = state.tasks.lock();
    let tid = tasks.current(cpu).ok_or(KernelError::NotFound)?;
    let pid = tasks
        .task(tid)
        .and_then(|t| t.proc)
        .ok_or(KernelError::Invalid)?;
    Ok((tid, pid))
}

/// Wire `[addr, addr + size)` of physical memory into the caller's
/// address space at the same virtual address, returning the pointer.
pub fn driver_mmap(state: &KernelState, cpu: usize, addr: u64, size: u64) -> KernelResult<u64> {
    if !page_aligned(addr) || !page_aligned(size) || size == 0 {
        return Err(KernelError::Invalid);
    }
    let (_, pid) = caller(state, cpu)?;
    let npages = (size / PAGE_SIZE) as usize;

    let mm = state.mm.lock();
    let ifs = mm.ifs();
    drop(mm);

    let mut procs = state.procs.lock();
    let proc = procs.get_mut(pid)?;
    // A driver block may not exist yet for MMIO ranges; add one lazily.
    if proc.vmem.entry_at(addr).is_none() && !proc.vmem.contains_range(addr, 1) {
        let _ = proc.vmem.block_add(ifs, addr, addr + size - 1);
    }
    proc.vmem.wire(ifs, addr, npages, addr)?;
    Ok(addr)
}

/// Unmapping driver regions is not part of the core.
pub fn driver_munmap() -> KernelResult<u64> {
    Err(KernelError::Unsupported)
}

/// Register a character device named `name` owned by the caller.
pub fn driver_register(state: &KernelState, cpu: usize, name: &str) -> KernelResult<u64> {
    let (tid, pid) = caller(state, cpu)?;
    let index = state
        .devfs
        .register(name, Device::Char(CharDevice::default()), pid, tid)?;
    Ok(index as u64)
}

/// Driver message hand-off: putc/getc/write against an owned device.
pub fn driver_msg(
    state: &KernelState,
    cpu: usize,
    index: usize,
    op: usize,
    payload: &[u8],
) -> KernelResult<u64> {
    let (_, pid) = caller(state, cpu)?;
    let mut tasks = state.tasks.lock();
    match op {
        DRIVER_MSG_PUTC => {
            let byte = *payload.first().ok_or(KernelError::Invalid)?;
            state
                .devfs
                .deliver(&mut tasks, index, pid, Message::Byte(byte))?;
            Ok(0)
        }
        DRIVER_MSG_WRITE => {
            let n = state.devfs.driver_write(&mut tasks, index, pid, payload)?;
            Ok(n as u64)
        }
        DRIVER_MSG_GETC => {
            drop(tasks);
            match state.devfs.driver_getc(index, pid)? {
                Some(b) => Ok(b as u64),
                None => Err(KernelError::WouldBlock),
            }
        }
        _ => Err(KernelError::Invalid),
    }
}

/// Raw port IO for driver processes.
pub fn driver_io(nr: usize, port: u16, data: u32) -> KernelResult<u64> {
    match nr {
        DRIVER_IN8 => crate::arch::port_in(1, port).map(u64::from),
        DRIVER_IN16 => crate::arch::port_in(2, port).map(u64::from),
        DRIVER_IN32 => crate::arch::port_in(4, port).map(u64::from),
        DRIVER_OUT8 | DRIVER_OUT16 | DRIVER_OUT32 => {
            let width = match nr {
                DRIVER_OUT8 => 1,
                DRIVER_OUT16 => 2,
                _ => 4,
            };
            crate::arch::port_out(width, port, data).map(|_| 0)
        }
        _ => Err(KernelError::Invalid),
    }
}

/// Entry point for the driver syscall: `nr` selects the sub-operation.
pub fn sys_driver(
    state: &KernelState,
    cpu: usize,
    nr: usize,
    args: &SyscallArgs,
) -> KernelResult<u64> {
    match nr {
        DRIVER_MSG => {
            let index = args.arg(1) as usize;
            let op = args.arg(2) as usize;
            let byte = [args.arg(3) as u8];
            driver_msg(state, cpu, index, op, &byte)
        }
        DRIVER_MMAP => driver_mmap(state, cpu, args.arg(1), args.arg(2)),
        DRIVER_MUNMAP => driver_munmap(),
        DRIVER_REG_DEV => {
            let name = super::user_cstr(state, cpu, args.arg(1))?;
            driver_register(state, cpu, &name)
        }
        DRIVER_IN8 | DRIVER_IN16 | DRIVER_IN32 | DRIVER_OUT8 | DRIVER_OUT16 | DRIVER_OUT32 => {
            driver_io(nr, args.arg(1) as u16, args.arg(2) as u32)
        }
        _ => Err(KernelError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::fresh_state;
    use crate::syscall::process::tests::spawn_current;

    #[test]
    fn register_then_feed_and_drain() {
        let state = fresh_state();
        let (_pid, _task) = spawn_current(&state, 0);

        let index = driver_register(&state, 0, "kbd").unwrap() as usize;
        driver_msg(&state, 0, index, DRIVER_MSG_PUTC, b"A").unwrap();
        driver_msg(&state, 0, index, DRIVER_MSG_WRITE, b"BC").unwrap();

        // The input ring now carries the driver's bytes.
        let entry = state.devfs.entry(index).unwrap();
        match &entry.device {
            Device::Char(c) => {
                assert_eq!(c.ibuf.get(), Some(b'A'));
                assert_eq!(c.ibuf.get(), Some(b'B'));
                assert_eq!(c.ibuf.get(), Some(b'C'));
            }
            Device::Block => panic!("registered a char device"),
        }

        // Nothing queued for the driver yet.
        assert_eq!(
            driver_msg(&state, 0, index, DRIVER_MSG_GETC, b"").unwrap_err(),
            KernelError::WouldBlock
        );
    }

    #[test]
    fn mmap_wires_the_requested_range() {
        let state = fresh_state();
        let (pid, _task) = spawn_current(&state, 0);

        let addr = 0x7000_0000u64;
        assert_eq!(driver_mmap(&state, 0, addr, 0x3000).unwrap(), addr);
        let procs = state.procs.lock();
        let proc = procs.get(pid).unwrap();
        assert!(proc.vmem.contains_range(addr, 0x3000));

        drop(procs);
        assert_eq!(
            driver_mmap(&state, 0, addr + 0x123, 0x1000).unwrap_err(),
            KernelError::Invalid
        );
    }

    #[test]
    fn foreign_process_cannot_push() {
        let state = fresh_state();
        let (_pid, _task) = spawn_current(&state, 0);
        let index = driver_register(&state, 0, "uart").unwrap() as usize;

        // A second process on another CPU tries the same device.
        let (_pid2, _task2) = spawn_current(&state, 1);
        assert_eq!(
            driver_msg(&state, 1, index, DRIVER_MSG_PUTC, b"x").unwrap_err(),
            KernelError::Invalid
        );
    }
}
