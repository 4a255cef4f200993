//! The synchronization engine and its non-real-time handle.
//!
//! [`SyncEngine::on_audio_buffer`] is the single real-time entry point,
//! called once per host audio buffer. Each call runs one processing
//! quantum: drain control data, capture the session snapshot, reconcile
//! transport and tempo between the host and the session, and commit the
//! snapshot back. Committing is always the last thing a quantum does.
//!
//! [`EngineHandle`] is the cloneable surface everything else talks to:
//! UI, host action bindings, script APIs. It never blocks the processing
//! thread; requests travel through the [`crate::control::ControlChannel`]
//! and results come back through [`Telemetry`].

use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, info};

use crate::clock::{phase, Micros};
use crate::control::{ControlChannel, EngineRequest};
use crate::drift::{DriftAction, DriftCorrector, DriftFrame};
use crate::error::{Error, Result};
use crate::filter::HostTimeFilter;
use crate::host::{HostTimeline, TempoMarker};
use crate::launch;
use crate::lockfree::{AtomicDouble, AtomicFlag};
use crate::offsets::{Discontinuity, JumpOffsetTracker};
use crate::session::{SessionFabric, SessionState};
use crate::transport::{HostEdge, TransportPhase, TransportStateMachine};
use crate::worker::{HostCommand, HostWorker};

pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 999.0;

/// Lock-free snapshot of the last committed quantum, readable from any
/// thread.
#[derive(Debug, Default)]
pub struct Telemetry {
    tempo: AtomicDouble,
    beat: AtomicDouble,
    phase: AtomicDouble,
    playing: AtomicFlag,
}

impl Telemetry {
    fn publish(&self, tempo: f64, beat: f64, phase: f64, playing: bool) {
        self.tempo.set(tempo);
        self.beat.set(beat);
        self.phase.set(phase);
        self.playing.set(playing);
    }

    pub fn tempo(&self) -> f64 {
        self.tempo.get()
    }

    pub fn beat(&self) -> f64 {
        self.beat.get()
    }

    pub fn phase(&self) -> f64 {
        self.phase.get()
    }

    pub fn playing(&self) -> bool {
        self.playing.get()
    }
}

pub struct SyncEngine {
    host: Arc<dyn HostTimeline>,
    session: Arc<dyn SessionFabric>,
    control: Arc<ControlChannel>,
    telemetry: Arc<Telemetry>,
    commands: Sender<HostCommand>,
    // owns the worker thread; dropped last
    _worker: HostWorker,
    filter: HostTimeFilter,
    transport: TransportStateMachine,
    drift: DriftCorrector,
    offsets: JumpOffsetTracker,
    sample_position: f64,
    sample_rate: f64,
    sample_micros: f64,
    buffer_frames: i64,
}

impl SyncEngine {
    /// Build an engine over a host timeline and a session fabric, spawning
    /// the host worker thread.
    pub fn new(
        host: Arc<dyn HostTimeline>,
        session: Arc<dyn SessionFabric>,
    ) -> Result<(SyncEngine, EngineHandle)> {
        let control = Arc::new(ControlChannel::new());
        let telemetry = Arc::new(Telemetry::default());

        // peer tempo edits route through the ordinary tempo-request path
        let callback_control = Arc::clone(&control);
        session.set_tempo_callback(Some(Box::new(move |bpm| {
            if callback_control.puppet() {
                callback_control.set_tempo(bpm);
            }
        })));

        let worker = HostWorker::spawn(Arc::clone(&host))?;
        let commands = worker.sender();

        let handle = EngineHandle {
            session: Arc::clone(&session),
            control: Arc::clone(&control),
            telemetry: Arc::clone(&telemetry),
        };
        let engine = SyncEngine {
            host,
            session,
            control,
            telemetry,
            commands,
            _worker: worker,
            filter: HostTimeFilter::new(),
            transport: TransportStateMachine::new(),
            drift: DriftCorrector::new(),
            offsets: JumpOffsetTracker::new(),
            sample_position: 0.0,
            sample_rate: 0.0,
            sample_micros: 0.0,
            buffer_frames: 0,
        };
        info!("sync engine created");
        Ok((engine, handle))
    }

    /// Run one processing quantum. Call once per audio buffer from the
    /// real-time thread.
    pub fn on_audio_buffer(&mut self, frames: i64, sample_rate: f64) {
        if sample_rate <= 0.0 || frames <= 0 {
            return;
        }
        if !self.session.enabled() {
            if self.transport.is_started() {
                self.transport.stop();
                self.offsets.reset();
                self.drift.reset();
            }
            return;
        }

        if sample_rate != self.sample_rate || frames != self.buffer_frames {
            debug!("audio format now {frames} frames at {sample_rate}");
            self.sample_rate = sample_rate;
            self.sample_micros = 1.0e6 / sample_rate;
            self.buffer_frames = frames;
            self.filter.reset();
        }

        let now = self.session.clock_now();
        let filtered = self
            .filter
            .sample_time_to_host_time(self.sample_position, now);
        self.sample_position += frames as f64;

        // predict to the end of the buffer at the listener's ear
        let latency = Micros::from_seconds(self.host.output_latency());
        let frame_time = Micros((frames as f64 * self.sample_micros).round() as i64);
        let host_time = filtered + latency + frame_time;

        self.process(host_time, frames);
    }

    fn process(&mut self, host_time: Micros, frames: i64) {
        let request = self.control.drain();
        let mut state = self.session.capture();

        let frame_secs = frames as f64 / self.sample_rate;
        let rolling = self.host.play_state().is_rolling();
        let pos = if rolling {
            self.host.play_position() + frame_secs
        } else {
            self.host.cursor_position()
        };

        // a countdown armed last quantum ticks before new decisions
        if self.transport.tick(frames) {
            let _ = self.commands.send(HostCommand::Play);
        }

        let edge = self.transport.observe_host(rolling);

        let mut start = request.request_start;
        let mut stop = request.request_stop;
        match edge {
            Some(HostEdge::BeganRolling) if !self.transport.is_started() => start = true,
            Some(HostEdge::StoppedRolling)
                if self.transport.is_started() && !self.transport.is_launching() =>
            {
                stop = true
            }
            _ => {}
        }
        if self.session.start_stop_sync_enabled() {
            if state.is_playing() && !self.transport.is_started() {
                start = true;
            }
            if !state.is_playing() && self.transport.is_started() {
                stop = true;
            }
        }

        if stop && self.transport.is_started() {
            self.end_playback(&mut state, &request, host_time);
        } else if start && !self.transport.is_started() {
            self.begin_playback(&mut state, &request, host_time, pos, rolling);
        }

        let local_beat = self.host.beats_at_time(pos);
        if self.transport.phase() == TransportPhase::Playing && rolling {
            if let Discontinuity::FreeSeek { phase } = self.offsets.observe(
                local_beat,
                self.host.loop_region(),
                self.transport.past_safety_window(),
            ) {
                // a seek invalidates the old mapping; re-seat it once
                let beat = state.beat_at_time(host_time).floor() + phase;
                state.force_beat_at_time(beat, host_time);
            }
        }

        let tempo_request_pending = request.requested_tempo > 0.0;
        if self.transport.phase() == TransportPhase::Playing && rolling {
            let marker = self
                .host
                .find_tempo_marker(pos)
                .and_then(|index| self.host.tempo_marker(index));
            let session_beat = state.beat_at_time(host_time);
            let frame = DriftFrame {
                local_phase: self.offsets.apparent_phase(local_beat),
                session_phase: phase(session_beat, 1.0),
                session_beat,
                local_bpm: self.host.tempo_time_sig_at(pos - frame_secs).bpm,
                session_bpm: state.tempo(),
                marker_phase: marker
                    .as_ref()
                    .map(|m| phase(self.host.beats_at_time(m.time), 1.0))
                    .unwrap_or(0.0),
                has_marker: marker.is_some(),
                frame_ms: frame_secs * 1.0e3,
                is_master: request.is_master,
                is_puppet: request.is_puppet,
                tempo_request_pending,
                session_playing: state.is_playing(),
                past_safety_window: self.transport.past_safety_window(),
                launch_pending: self.transport.is_launching(),
            };
            match self.drift.evaluate(&frame) {
                DriftAction::None => {}
                DriftAction::ForcePush { beat } => {
                    state.force_beat_at_time(beat, host_time);
                }
                DriftAction::RetuneSession { bpm, at_beat } => {
                    let at = state.time_at_beat(at_beat);
                    state.set_tempo(bpm, at);
                }
                DriftAction::NudgeRateDown => {
                    let _ = self.commands.send(HostCommand::NudgeRateDown);
                }
                DriftAction::NudgeRateUp => {
                    let _ = self.commands.send(HostCommand::NudgeRateUp);
                }
                DriftAction::ReleaseNudge => {
                    let _ = self.commands.send(HostCommand::ResetPlayrate);
                }
            }
        }

        if tempo_request_pending {
            self.apply_tempo_request(
                &mut state,
                request.requested_tempo,
                request.is_puppet,
                pos,
                host_time,
            );
        }

        self.telemetry.publish(
            state.tempo(),
            state.beat_at_time(host_time),
            state.phase_at_time(host_time, request.quantum),
            state.is_playing(),
        );

        // the commit is the quantum's last act
        self.session.commit(state);
    }

    fn begin_playback(
        &mut self,
        state: &mut SessionState,
        request: &EngineRequest,
        host_time: Micros,
        pos: f64,
        rolling: bool,
    ) {
        if request.is_puppet && self.session.num_peers() > 0 && !rolling {
            // the countdown is measured from a fresh timing fit
            self.filter.reset();
            let plan = launch::plan(
                state,
                self.host.as_ref(),
                host_time,
                self.sample_micros,
                request.quantum,
            );
            debug!(
                "quantized launch: {} frames to boundary, cursor {}",
                plan.frames_to_wait, plan.cursor_time
            );
            if let Some(marker) = plan.marker_rewrite {
                let _ = self.commands.send(HostCommand::BeginUndoBlock);
                let _ = self.commands.send(HostCommand::RewriteTempoMarker(marker));
                let _ = self.commands.send(HostCommand::EndUndoBlock);
            }
            let _ = self.commands.send(HostCommand::SetEditCursor {
                time: plan.cursor_time,
                seek_play: true,
            });
            self.transport.begin(plan.frames_to_wait);
            if !self.transport.is_launching() {
                let _ = self.commands.send(HostCommand::Play);
            }
        } else {
            state.set_is_playing(true, host_time);
            let beat = phase(self.host.beats_at_time(pos), request.quantum);
            state.request_beat_at_start_playing_time(beat, request.quantum);
            self.transport.begin(0);
            if request.is_puppet && !rolling {
                let _ = self.commands.send(HostCommand::Play);
            }
        }
    }

    fn end_playback(&mut self, state: &mut SessionState, request: &EngineRequest, at: Micros) {
        self.transport.stop();
        self.offsets.reset();
        let nudge_engaged = self.drift.reset();
        state.set_is_playing(false, at);

        if request.is_puppet {
            let _ = self.commands.send(HostCommand::Stop);
            let _ = self.commands.send(HostCommand::ResetPlayrate);
        } else if nudge_engaged {
            let _ = self.commands.send(HostCommand::ResetPlayrate);
        }
    }

    /// Apply a drained tempo request: the session always adopts it, and a
    /// puppet writes it into the host timeline as well.
    fn apply_tempo_request(
        &mut self,
        state: &mut SessionState,
        bpm: f64,
        puppet: bool,
        pos: f64,
        host_time: Micros,
    ) {
        if (bpm - state.tempo()).abs() > state.tempo() * crate::drift::TEMPO_TOLERANCE {
            state.set_tempo(bpm, host_time);
        }

        // the drained flag, not a fresh read: the processing path takes no
        // locks beyond the drain's try-lock
        if !puppet {
            return;
        }
        let marker = self
            .host
            .find_tempo_marker(pos)
            .and_then(|index| self.host.tempo_marker(index));
        let host_bpm = self.host.tempo_time_sig_at(pos).bpm;
        if (bpm - host_bpm).abs() <= host_bpm * crate::drift::TEMPO_TOLERANCE {
            return;
        }
        let _ = self.commands.send(HostCommand::BeginUndoBlock);
        match marker {
            Some(marker) => {
                let _ = self
                    .commands
                    .send(HostCommand::RewriteTempoMarker(TempoMarker { bpm, ..marker }));
            }
            None => {
                let _ = self.commands.send(HostCommand::SetTempo(bpm));
            }
        }
        let _ = self.commands.send(HostCommand::EndUndoBlock);
        let _ = self.commands.send(HostCommand::UpdateTimeline);
    }
}

/// Cloneable non-real-time handle to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    session: Arc<dyn SessionFabric>,
    control: Arc<ControlChannel>,
    telemetry: Arc<Telemetry>,
}

impl EngineHandle {
    pub fn set_enabled(&self, enabled: bool) {
        info!("sync {}", if enabled { "enabled" } else { "disabled" });
        self.session.set_enabled(enabled);
    }

    pub fn enabled(&self) -> bool {
        self.session.enabled()
    }

    /// Request a transport start on the next quantum.
    pub fn start(&self) {
        self.control.request_start();
    }

    /// Request a transport stop on the next quantum.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Toggle the transport.
    pub fn start_stop(&self) {
        if self.playing() {
            self.stop();
        } else {
            self.start();
        }
    }

    pub fn playing(&self) -> bool {
        self.session.capture_app().is_playing()
    }

    /// Request a session tempo change, clamped to the valid range.
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        if !(MIN_TEMPO..=MAX_TEMPO).contains(&bpm) {
            return Err(Error::InvalidTempo(bpm));
        }
        self.control.set_tempo(bpm);
        Ok(())
    }

    pub fn tempo(&self) -> f64 {
        self.session.capture_app().tempo()
    }

    pub fn set_quantum(&self, quantum: f64) -> Result<()> {
        if quantum <= 0.0 {
            return Err(Error::InvalidQuantum(quantum));
        }
        self.control.set_quantum(quantum);
        Ok(())
    }

    pub fn quantum(&self) -> f64 {
        self.control.quantum()
    }

    /// Assert tempo/phase authority. Only effective while following.
    pub fn set_master(&self, on: bool) {
        self.control.set_master(on);
    }

    pub fn master(&self) -> bool {
        self.control.master()
    }

    /// Follow the session: adopt peer tempo and transport.
    pub fn set_puppet(&self, on: bool) {
        self.control.set_puppet(on);
    }

    pub fn puppet(&self) -> bool {
        self.control.puppet()
    }

    pub fn num_peers(&self) -> usize {
        self.session.num_peers()
    }

    pub fn set_start_stop_sync_enabled(&self, enabled: bool) {
        self.session.set_start_stop_sync_enabled(enabled);
    }

    pub fn start_stop_sync_enabled(&self) -> bool {
        self.session.start_stop_sync_enabled()
    }

    pub fn clock_now(&self) -> Micros {
        self.session.clock_now()
    }

    pub fn beat_at_time(&self, time: Micros) -> f64 {
        self.session.capture_app().beat_at_time(time)
    }

    pub fn phase_at_time(&self, time: Micros, quantum: f64) -> f64 {
        self.session.capture_app().phase_at_time(time, quantum)
    }

    pub fn time_at_beat(&self, beat: f64) -> Micros {
        self.session.capture_app().time_at_beat(beat)
    }

    /// Hard session re-map. Disruptive to peers; prefer
    /// [`Self::request_beat_at_time`].
    pub fn force_beat_at_time(&self, beat: f64, time: Micros) {
        let mut state = self.session.capture_app();
        state.force_beat_at_time(beat, time);
        self.session.commit_app(state);
    }

    pub fn request_beat_at_time(&self, beat: f64, time: Micros, quantum: f64) {
        let mut state = self.session.capture_app();
        state.request_beat_at_time(beat, time, quantum);
        self.session.commit_app(state);
    }

    /// Combined transport-and-alignment request, for peers that start
    /// playback and pin a beat in one step.
    pub fn set_playing_and_request_beat_at_time(
        &self,
        playing: bool,
        beat: f64,
        time: Micros,
        quantum: f64,
    ) {
        let mut state = self.session.capture_app();
        state.set_is_playing(playing, time);
        state.request_beat_at_time(beat, time, quantum);
        self.session.commit_app(state);
    }

    /// Last committed quantum's tempo, beat, phase and transport flag.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }
}
