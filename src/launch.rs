//! Quantized-launch planning.
//!
//! When the transport starts with peers present, playback must not begin
//! immediately: the launch is deferred to the next session quantum boundary
//! so beat zero of the host bar lands exactly on session phase zero. The
//! plan pins the session mapping, computes the frame countdown to the
//! boundary, and adjusts the host cursor for the sub-buffer remainder the
//! countdown cannot express.

use crate::clock::Micros;
use crate::host::{HostTimeline, TempoMarker};
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Audio frames until the host transport must start. Zero means start
    /// on this buffer.
    pub frames_to_wait: i64,
    /// Host cursor position (seconds) to seek to before starting, already
    /// compensated for countdown rounding.
    pub cursor_time: f64,
    /// Tempo marker rewrite that flattens any ramp into the launch point.
    pub marker_rewrite: Option<TempoMarker>,
}

/// Build a launch plan and re-map `state` so session beat zero falls on
/// the first quantum boundary at or after `now`.
///
/// `sample_micros` is the duration of one audio frame in microseconds.
pub fn plan(
    state: &mut SessionState,
    host: &dyn HostTimeline,
    now: Micros,
    sample_micros: f64,
    quantum: f64,
) -> LaunchPlan {
    let cursor = host.cursor_position();
    let bar_time = host.next_bar_time(cursor);
    let tempo = host.tempo_time_sig_at(bar_time).bpm;

    state.set_tempo(tempo, now);
    state.set_is_playing(true, now);
    state.request_beat_at_start_playing_time(0.0, quantum);
    let target = state.time_at_beat(0.0);

    // start at or after the boundary, never before
    let delta = (target - now).0.max(0);
    let frames_to_wait = (delta as f64 / sample_micros).ceil() as i64;
    let actual_start = now + Micros((frames_to_wait as f64 * sample_micros).round() as i64);

    let marker_rewrite = host
        .find_tempo_marker(cursor)
        .and_then(|index| host.tempo_marker(index))
        .map(|marker| TempoMarker {
            bpm: tempo,
            linear: false,
            ..marker
        });

    LaunchPlan {
        frames_to_wait,
        cursor_time: bar_time + (actual_start - target).as_seconds(),
        marker_rewrite,
    }
}
