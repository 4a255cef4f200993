//! Double-buffered control-data exchange between the non-real-time API
//! surface and the real-time processing context.
//!
//! Submitters take a short-held mutex; the single real-time consumer only
//! ever try-locks it. When the guard is contended the consumer falls back
//! to a lock-free mirror of the last successfully drained values, so a
//! missed tick costs at most one quantum of staleness and never a stall.

use core::cell::UnsafeCell;
use parking_lot::Mutex;

pub const DEFAULT_QUANTUM: f64 = 4.0;

/// One quantum's worth of control data.
///
/// `requested_tempo` (0 = none), `request_start` and `request_stop` are
/// transient: consumed exactly once per drain. `quantum`, `is_master` and
/// `is_puppet` are sticky and mirrored across contended drains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineRequest {
    pub requested_tempo: f64,
    pub request_start: bool,
    pub request_stop: bool,
    pub quantum: f64,
    pub is_master: bool,
    pub is_puppet: bool,
}

impl Default for EngineRequest {
    fn default() -> Self {
        Self {
            requested_tempo: 0.0,
            request_start: false,
            request_stop: false,
            quantum: DEFAULT_QUANTUM,
            is_master: false,
            is_puppet: false,
        }
    }
}

pub struct ControlChannel {
    shared: Mutex<EngineRequest>,
    mirror: UnsafeCell<EngineRequest>,
}

// SAFETY: `mirror` is only touched inside `drain`, which has exactly one
// caller thread (the processing context) by contract.
unsafe impl Sync for ControlChannel {}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(EngineRequest::default()),
            mirror: UnsafeCell::new(EngineRequest::default()),
        }
    }

    /// Request a transport start. Coalesces with any pending start.
    pub fn request_start(&self) {
        self.shared.lock().request_start = true;
    }

    /// Request a transport stop. Coalesces with any pending stop.
    pub fn request_stop(&self) {
        self.shared.lock().request_stop = true;
    }

    /// Request a tempo change; overwrites any undrained request.
    pub fn set_tempo(&self, bpm: f64) {
        self.shared.lock().requested_tempo = bpm;
    }

    pub fn set_quantum(&self, quantum: f64) {
        self.shared.lock().quantum = quantum;
    }

    pub fn set_master(&self, on: bool) {
        self.shared.lock().is_master = on;
    }

    pub fn set_puppet(&self, on: bool) {
        self.shared.lock().is_puppet = on;
    }

    pub fn quantum(&self) -> f64 {
        self.shared.lock().quantum
    }

    /// Master flag with the `master => puppet` invariant applied.
    pub fn master(&self) -> bool {
        let shared = self.shared.lock();
        shared.is_master && shared.is_puppet
    }

    pub fn puppet(&self) -> bool {
        self.shared.lock().is_puppet
    }

    /// Drain pending requests from the processing context.
    ///
    /// Never blocks: on contention the last-good mirror is returned with
    /// the transient fields cleared. Enforces `master => puppet` on the
    /// shared record (when the lock is held) and on the returned value.
    ///
    /// Must be called from exactly one thread.
    pub fn drain(&self) -> EngineRequest {
        // SAFETY: single consumer, see struct-level comment.
        let mirror = unsafe { &mut *self.mirror.get() };

        let mut request = EngineRequest {
            requested_tempo: 0.0,
            request_start: false,
            request_stop: false,
            ..*mirror
        };

        if let Some(mut shared) = self.shared.try_lock() {
            request.requested_tempo = shared.requested_tempo;
            shared.requested_tempo = 0.0;
            request.request_start = shared.request_start;
            shared.request_start = false;
            request.request_stop = shared.request_stop;
            shared.request_stop = false;

            if shared.is_master && !shared.is_puppet {
                shared.is_master = false;
            }

            mirror.quantum = shared.quantum;
            mirror.is_master = shared.is_master;
            mirror.is_puppet = shared.is_puppet;
        }

        request.quantum = mirror.quantum;
        request.is_puppet = mirror.is_puppet;
        request.is_master = mirror.is_master && mirror.is_puppet;
        request
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}
