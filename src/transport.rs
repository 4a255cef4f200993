//! Playback-launch state machine and host-transport edge detection.
//!
//! Ticks once per processing quantum. A quantized launch parks the machine
//! in `Starting` with a frame countdown; when it expires the transport is
//! started and the machine moves to `Playing`. The machine also watches the
//! host's rolling flag so external play/stop (a user hitting space in the
//! host UI) is observed as an edge exactly once.

/// Quanta to hold off drift correction after a start. Re-maps this close
/// to a launch fight the launch alignment itself.
pub const SAFETY_QUANTA: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPhase {
    #[default]
    Stopped,
    /// Counting down frames to a quantized start.
    Starting,
    Playing,
}

/// Host transport edge observed this quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEdge {
    BeganRolling,
    StoppedRolling,
}

#[derive(Debug, Default)]
pub struct TransportStateMachine {
    phase: TransportPhase,
    frames_remaining: i64,
    playing_quanta: u64,
    host_was_rolling: bool,
}

impl TransportStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    /// Transport is started or starting.
    pub fn is_started(&self) -> bool {
        self.phase != TransportPhase::Stopped
    }

    pub fn is_launching(&self) -> bool {
        self.phase == TransportPhase::Starting
    }

    /// Arm a launch `frames` audio frames from now. Zero frames starts
    /// immediately.
    pub fn begin(&mut self, frames: i64) {
        self.playing_quanta = 0;
        if frames <= 0 {
            self.phase = TransportPhase::Playing;
            self.frames_remaining = 0;
        } else {
            self.phase = TransportPhase::Starting;
            self.frames_remaining = frames;
        }
    }

    /// Advance a pending countdown by one buffer. Returns true exactly on
    /// the quantum where the countdown expires.
    pub fn tick(&mut self, frames: i64) -> bool {
        if self.phase != TransportPhase::Starting {
            return false;
        }
        self.frames_remaining -= frames;
        if self.frames_remaining <= 0 {
            self.phase = TransportPhase::Playing;
            self.frames_remaining = 0;
            true
        } else {
            false
        }
    }

    pub fn stop(&mut self) {
        self.phase = TransportPhase::Stopped;
        self.frames_remaining = 0;
        self.playing_quanta = 0;
    }

    /// Record the host's rolling flag for this quantum, returning the edge
    /// if it changed. Also advances the post-start settle counter.
    pub fn observe_host(&mut self, rolling: bool) -> Option<HostEdge> {
        let edge = match (self.host_was_rolling, rolling) {
            (false, true) => Some(HostEdge::BeganRolling),
            (true, false) => Some(HostEdge::StoppedRolling),
            _ => None,
        };
        self.host_was_rolling = rolling;
        if self.phase == TransportPhase::Playing {
            self.playing_quanta = self.playing_quanta.saturating_add(1);
        }
        edge
    }

    /// Enough quanta have elapsed since the start for drift correction to
    /// engage.
    pub fn past_safety_window(&self) -> bool {
        self.phase == TransportPhase::Playing && self.playing_quanta > SAFETY_QUANTA
    }
}
