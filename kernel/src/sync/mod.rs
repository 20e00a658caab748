//! Synchronization primitives for global kernel state.

mod once_lock;

pub use once_lock::{GlobalState, OnceLock};
