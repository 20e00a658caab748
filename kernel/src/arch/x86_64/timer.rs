//! The HZ=100 tick source.
//!
//! The legacy PIT drives IRQ0 through the 8259 pair. The interrupt stub
//! installed by the external IDT glue acknowledges the PIC and calls
//! [`tick`], which advances the jiffy counter and runs a scheduler step.

use pic8259::ChainedPics;
use spin::Mutex;

use crate::timer::HZ;

/// Remapped PIC vector bases.
pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

/// PIT input clock in Hz.
const PIT_CLOCK: u32 = 1_193_182;

pub static PICS: Mutex<ChainedPics> =
    // SAFETY: The chosen vector offsets avoid the CPU exception range.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Program the PIT for a periodic HZ-rate tick and unmask IRQ0.
pub fn init() {
    let divisor = (PIT_CLOCK / HZ as u32) as u16;
    // SAFETY: Standard PIT programming sequence on ports 0x43/0x40:
    // channel 0, lobyte/hibyte, rate generator.
    unsafe {
        use x86_64::instructions::port::Port;
        Port::<u8>::new(0x43).write(0x36u8);
        Port::<u8>::new(0x40).write((divisor & 0xFF) as u8);
        Port::<u8>::new(0x40).write((divisor >> 8) as u8);

        PICS.lock().initialize();
    }
}

/// Acknowledge IRQ0 at the PIC.
pub fn end_of_interrupt() {
    // SAFETY: Notifying end-of-interrupt for the timer vector is the
    // required PIC handshake.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET);
    }
}

/// Timer interrupt body: called by the IRQ0 stub on every tick.
///
/// Returns the task the CPU should switch to, if the scheduler picked a
/// different one.
pub fn tick(cpu: usize) -> Option<crate::sched::TaskId> {
    let next = crate::state::try_kernel().and_then(|state| state.tick(cpu));
    end_of_interrupt();
    next
}
