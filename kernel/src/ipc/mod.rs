//! IPC primitives shared by devfs and driver processes.
//!
//! The unit of hand-off between a driver process and the device layer is
//! a [`Message`]; the transport is a pair of single-producer
//! single-consumer [`Ring`] buffers per character device.

mod ring;

pub use ring::{Ring, RING_SIZE};

/// A message handed from a driver process to the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// One byte of device data
    Byte(u8),
}
