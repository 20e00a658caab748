//! x86_64 support: page-table driver, COM1 console, and the PIT tick.
//!
//! Everything the core treats as an external collaborator (IDT/GDT/TSS
//! programming, the boot trampoline) stays outside; this module only
//! implements the interfaces the core consumes.

pub mod mmu;
pub mod serial;
pub mod timer;

use crate::error::{KernelError, KernelResult};

/// Disable interrupts and halt forever.
pub fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Port input for the driver syscall.
pub fn port_in(width: u8, port: u16) -> KernelResult<u32> {
    use x86_64::instructions::port::Port;
    // SAFETY: Raw port IO is inherently device-dependent; the driver
    // syscall surface restricts it to driver processes.
    unsafe {
        match width {
            1 => Ok(u32::from(Port::<u8>::new(port).read())),
            2 => Ok(u32::from(Port::<u16>::new(port).read())),
            4 => Ok(Port::<u32>::new(port).read()),
            _ => Err(KernelError::Invalid),
        }
    }
}

/// Port output for the driver syscall.
pub fn port_out(width: u8, port: u16, data: u32) -> KernelResult<()> {
    use x86_64::instructions::port::Port;
    // SAFETY: See `port_in`.
    unsafe {
        match width {
            1 => Port::<u8>::new(port).write(data as u8),
            2 => Port::<u16>::new(port).write(data as u16),
            4 => Port::<u32>::new(port).write(data),
            _ => return Err(KernelError::Invalid),
        }
    }
    Ok(())
}
