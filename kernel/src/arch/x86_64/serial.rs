//! COM1 serial console.
//!
//! Backs the print macros and registers as the first console device.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::drivers::console::ConsoleDevice;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; probing it is safe on
        // every PC-compatible machine this kernel targets.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// The serial port as a console-list device.
pub struct SerialConsole;

impl ConsoleDevice for SerialConsole {
    fn write(&self, buf: &[u8]) {
        use core::fmt::Write;

        let mut port = SERIAL1.lock();
        for &b in buf {
            let _ = port.write_char(b as char);
        }
    }
}
