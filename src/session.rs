//! Session timeline snapshot and peer-fabric interface.
//!
//! The session timeline is the shared, peer-negotiated side of the bridge.
//! [`SessionState`] is the snapshot captured at the top of a processing
//! quantum, mutated locally, and committed back atomically at the end;
//! a partially applied snapshot is never visible.
//! [`SessionFabric`] is the collaborator boundary
//! behind which a real peer-to-peer implementation (or the in-process
//! [`MemorySession`]) lives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock::{beats_to_micros, phase, Micros, Timeline};
use crate::lockfree::AtomicFlag;

/// Callback invoked when the session tempo changes from the session side
/// (a peer edit), with the new tempo in BPM.
pub type TempoCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Snapshot of the session timeline, valid for one processing quantum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionState {
    timeline: Timeline,
    playing: bool,
    start_time: Micros,
}

impl SessionState {
    pub fn new(tempo: f64) -> Self {
        Self {
            timeline: Timeline::new(tempo, 0.0, Micros::ZERO),
            playing: false,
            start_time: Micros::ZERO,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.timeline.tempo()
    }

    /// Change the session tempo at `at`, keeping the beat there unchanged.
    pub fn set_tempo(&mut self, bpm: f64, at: Micros) {
        self.timeline.set_tempo(bpm, at);
    }

    /// Absolute session beat at a wall-clock time.
    pub fn beat_at_time(&self, time: Micros) -> f64 {
        self.timeline.beat_at_time(time)
    }

    /// Session phase within the quantum at a wall-clock time.
    pub fn phase_at_time(&self, time: Micros, quantum: f64) -> f64 {
        self.timeline.phase_at_time(time, quantum)
    }

    /// Wall-clock time at which a session beat occurs.
    pub fn time_at_beat(&self, beat: f64) -> Micros {
        self.timeline.time_at_beat(beat)
    }

    /// Hard re-map so that `beat` occurs exactly at `time`.
    ///
    /// The authority push: socially disruptive, reserved for the master
    /// peer and for seek re-seating.
    pub fn force_beat_at_time(&mut self, beat: f64, time: Micros) {
        self.timeline.force_beat_at_time(beat, time);
    }

    /// Map `beat` to the earliest time at or after `time` whose phase
    /// within `quantum` matches. The polite, non-disruptive re-map.
    pub fn request_beat_at_time(&mut self, beat: f64, time: Micros, quantum: f64) {
        let current = self.phase_at_time(time, quantum);
        let wanted = phase(beat, quantum);
        let mut delta = wanted - current;
        if delta < 0.0 {
            delta += quantum;
        }
        let target = time + beats_to_micros(delta, self.timeline.tempo());
        self.force_beat_at_time(beat, target);
    }

    /// [`Self::request_beat_at_time`] anchored at the transport start time,
    /// so beat `beat` lands on the first quantum boundary of playback.
    pub fn request_beat_at_start_playing_time(&mut self, beat: f64, quantum: f64) {
        let start = self.start_time;
        self.request_beat_at_time(beat, start, quantum);
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Transport start time recorded by the last stop-to-play transition.
    pub fn start_playing_time(&self) -> Micros {
        self.start_time
    }

    pub fn set_is_playing(&mut self, playing: bool, at: Micros) {
        if playing && !self.playing {
            self.start_time = at;
        }
        self.playing = playing;
    }
}

/// The peer-synchronization collaborator boundary.
///
/// `capture`/`commit` bracket each processing quantum; `capture_app` and
/// `commit_app` serve the non-real-time API surface. Implementations must
/// make commits atomic: no partially applied snapshot may ever be
/// observed.
pub trait SessionFabric: Send + Sync {
    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    fn num_peers(&self) -> usize;

    fn start_stop_sync_enabled(&self) -> bool;

    fn set_start_stop_sync_enabled(&self, enabled: bool);

    /// Current session wall-clock time.
    fn clock_now(&self) -> Micros;

    /// Capture a snapshot from the processing context.
    fn capture(&self) -> SessionState;

    /// Commit a snapshot from the processing context.
    fn commit(&self, state: SessionState);

    /// Capture a snapshot from a non-real-time context.
    fn capture_app(&self) -> SessionState;

    /// Commit a snapshot from a non-real-time context. Tempo changes
    /// committed here count as session-side edits and fire the tempo
    /// callback.
    fn commit_app(&self, state: SessionState);

    fn set_tempo_callback(&self, callback: Option<TempoCallback>);
}

/// In-process session fabric: zero peers, one shared timeline.
///
/// Serves as the solo-authority backend when no peer fabric is attached,
/// and as the scripted session in tests (peer count is settable).
pub struct MemorySession {
    state: Mutex<SessionState>,
    enabled: AtomicFlag,
    start_stop_sync: AtomicFlag,
    peers: AtomicUsize,
    epoch: Instant,
    tempo_callback: Mutex<Option<TempoCallback>>,
}

impl MemorySession {
    pub fn new(tempo: f64) -> Self {
        Self {
            state: Mutex::new(SessionState::new(tempo)),
            enabled: AtomicFlag::new(false),
            start_stop_sync: AtomicFlag::new(false),
            peers: AtomicUsize::new(0),
            epoch: Instant::now(),
            tempo_callback: Mutex::new(None),
        }
    }

    /// Scripted peer count, for tests and demos.
    pub fn set_num_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::Release);
    }
}

impl SessionFabric for MemorySession {
    fn enabled(&self) -> bool {
        self.enabled.get()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    fn num_peers(&self) -> usize {
        self.peers.load(Ordering::Acquire)
    }

    fn start_stop_sync_enabled(&self) -> bool {
        self.start_stop_sync.get()
    }

    fn set_start_stop_sync_enabled(&self, enabled: bool) {
        self.start_stop_sync.set(enabled);
    }

    fn clock_now(&self) -> Micros {
        Micros(self.epoch.elapsed().as_micros() as i64)
    }

    fn capture(&self) -> SessionState {
        *self.state.lock()
    }

    fn commit(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn capture_app(&self) -> SessionState {
        *self.state.lock()
    }

    fn commit_app(&self, state: SessionState) {
        let tempo_changed = {
            let mut shared = self.state.lock();
            let changed = (shared.tempo() - state.tempo()).abs() > f64::EPSILON;
            *shared = state;
            changed
        };
        if tempo_changed {
            // fire outside the state lock
            if let Some(callback) = self.tempo_callback.lock().as_ref() {
                callback(state.tempo());
            }
        }
    }

    fn set_tempo_callback(&self, callback: Option<TempoCallback>) {
        *self.tempo_callback.lock() = callback;
    }
}
