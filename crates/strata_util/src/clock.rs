//! Hybrid logical clock.
//!
//! Timestamps pack wall-clock microseconds in the high bits and a logical
//! counter in the low 12 bits. `now` is strictly increasing on a single
//! process; `update` ratchets the clock past timestamps observed from peers
//! so causally related events never reorder.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical component.
const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid physical/logical timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_micros_and_logical(micros: u64, logical: u64) -> Self {
        Timestamp((micros << LOGICAL_BITS) + logical)
    }

    pub fn physical_micros(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical_micros(), self.logical())
    }
}

struct ClockState {
    last_usec: u64,
    next_logical: u64,
}

/// Monotonic hybrid clock shared by every tablet peer on a master.
pub struct HybridClock {
    state: Mutex<ClockState>,
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                last_usec: 0,
                next_logical: 0,
            }),
        }
    }

    /// Return a timestamp greater than every previous return value.
    pub fn now(&self) -> Timestamp {
        let mut state = self.state.lock().unwrap();
        let now_usec = wall_clock_micros();
        if now_usec > state.last_usec {
            state.last_usec = now_usec;
            state.next_logical = 1;
            return Timestamp::from_micros_and_logical(now_usec, 0);
        }
        // Physical time stalled or went backwards; burn logical values.
        let ts = Timestamp::from_micros_and_logical(state.last_usec, state.next_logical);
        state.next_logical += 1;
        ts
    }

    /// Ratchet the clock past a timestamp observed from a peer.
    pub fn update(&self, observed: Timestamp) {
        let mut state = self.state.lock().unwrap();
        let local = Timestamp::from_micros_and_logical(state.last_usec, state.next_logical);
        if observed < local {
            return;
        }
        state.last_usec = observed.physical_micros();
        state.next_logical = observed.logical() + 1;
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
