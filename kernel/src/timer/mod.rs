//! Jiffy timer events.
//!
//! The system tick runs at `HZ` = 100, so one jiffy is 10 ms. Sleeping
//! processes sit on an event list ordered by target jiffy; every tick the
//! scheduler pops due events from the head and wakes the referenced
//! processes.

extern crate alloc;

use alloc::vec::Vec;

use crate::process::Pid;

/// Ticks per second
pub const HZ: u64 = 100;
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A pending wake-up: `pid` becomes ready once `jiffy` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub jiffy: u64,
    pub pid: Pid,
}

/// The timer event list, ascending by target jiffy.
///
/// Events firing on the same jiffy keep insertion order.
#[derive(Default)]
pub struct TimerList {
    events: Vec<TimerEvent>,
}

impl TimerList {
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Queue a wake-up for `pid` at `jiffy`.
    pub fn insert(&mut self, jiffy: u64, pid: Pid) {
        let pos = self
            .events
            .iter()
            .position(|e| e.jiffy > jiffy)
            .unwrap_or(self.events.len());
        self.events.insert(pos, TimerEvent { jiffy, pid });
    }

    /// Pop every event due at `now` (target jiffy <= now), head first.
    pub fn expire(&mut self, now: u64) -> Vec<Pid> {
        let due = self
            .events
            .iter()
            .position(|e| e.jiffy > now)
            .unwrap_or(self.events.len());
        self.events.drain(..due).map(|e| e.pid).collect()
    }

    /// Drop every event belonging to `pid` (process exit).
    pub fn cancel(&mut self, pid: Pid) {
        self.events.retain(|e| e.pid != pid);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Next firing jiffy, if any.
    pub fn next_fire(&self) -> Option<u64> {
        self.events.first().map(|e| e.jiffy)
    }
}

/// Convert a (seconds, nanoseconds) duration into jiffies.
pub fn duration_to_jiffies(sec: u64, nsec: u64) -> u64 {
    sec * HZ + nsec * HZ / NANOS_PER_SEC
}

/// Convert jiffies back into (seconds, nanoseconds).
pub fn jiffies_to_duration(jiffies: u64) -> (u64, u64) {
    (jiffies / HZ, (jiffies % HZ) * NANOS_PER_SEC / HZ)
}
