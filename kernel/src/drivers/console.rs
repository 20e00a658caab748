//! Console writers.
//!
//! The kernel's diagnostic output goes to an append-only list of console
//! devices (serial port first, a text screen when present). Writers are
//! serialized by the list lock; the `log` facade forwards records here.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// An append-only console sink.
pub trait ConsoleDevice: Send + Sync {
    fn write(&self, buf: &[u8]);
}

/// Registered console devices, written in registration order.
pub struct ConsoleList {
    devices: Mutex<Vec<Arc<dyn ConsoleDevice>>>,
}

impl Default for ConsoleList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleList {
    pub const fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, dev: Arc<dyn ConsoleDevice>) {
        self.devices.lock().push(dev);
    }

    /// Write `buf` to every registered device.
    pub fn write_all(&self, buf: &[u8]) {
        for dev in self.devices.lock().iter() {
            dev.write(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

/// `log` facade bridge onto the console list.
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(state) = crate::state::try_kernel() {
            use core::fmt::Write;

            struct Sink<'a>(&'a ConsoleList);
            impl core::fmt::Write for Sink<'_> {
                fn write_str(&mut self, s: &str) -> core::fmt::Result {
                    self.0.write_all(s.as_bytes());
                    Ok(())
                }
            }

            let mut sink = Sink(&state.consoles);
            let _ = writeln!(sink, "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Route `log` records to the console list. Call once at boot.
pub fn init_logging() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if cfg!(feature = "boot_debug") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ConsoleDevice for Counter {
        fn write(&self, buf: &[u8]) {
            self.0.fetch_add(buf.len(), Ordering::Relaxed);
        }
    }

    #[test]
    fn write_all_reaches_every_device() {
        let list = ConsoleList::new();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        list.register(a.clone());
        list.register(b.clone());
        list.write_all(b"hello");
        assert_eq!(a.0.load(Ordering::Relaxed), 5);
        assert_eq!(b.0.load(Ordering::Relaxed), 5);
    }
}
