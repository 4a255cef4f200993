//! Host timeline collaborator interface.
//!
//! The engine consumes this trait, it never implements it: the plugin glue
//! wraps the host application's timeline API behind it. Query methods are
//! cheap reads safe to call from the processing context; mutation methods
//! are only ever invoked from the [`crate::worker::HostWorker`] thread.

/// Host transport flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Recording,
}

impl PlayState {
    /// Playing or recording, i.e. the playhead is advancing.
    pub fn is_rolling(self) -> bool {
        matches!(self, PlayState::Playing | PlayState::Recording)
    }
}

/// Tempo and time signature in effect at some timeline position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoTimeSig {
    pub bpm: f64,
    pub sig_num: u32,
    pub sig_denom: u32,
}

/// One tempo/time-signature marker on the host timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMarker {
    pub index: usize,
    /// Marker position in seconds.
    pub time: f64,
    pub measure: i32,
    pub beat: f64,
    pub bpm: f64,
    pub sig_num: u32,
    pub sig_denom: u32,
    /// Linear (ramped) tempo transition into the next marker.
    pub linear: bool,
}

/// The host application's transport/position/tempo state.
pub trait HostTimeline: Send + Sync {
    fn play_state(&self) -> PlayState;

    /// Edit cursor position in seconds.
    fn cursor_position(&self) -> f64;

    /// Latency-compensated playhead position in seconds.
    fn play_position(&self) -> f64;

    /// Output latency in seconds.
    fn output_latency(&self) -> f64;

    /// Absolute beat (quarter note) position at a timeline time.
    fn beats_at_time(&self, time: f64) -> f64;

    /// Start time of the bar following `time` (the quantized-launch
    /// target position).
    fn next_bar_time(&self, time: f64) -> f64;

    fn tempo_time_sig_at(&self, time: f64) -> TempoTimeSig;

    /// Index of the tempo marker in effect at `time`, if any exist.
    fn find_tempo_marker(&self, time: f64) -> Option<usize>;

    fn tempo_marker(&self, index: usize) -> Option<TempoMarker>;

    /// Rewrite a tempo marker in place. Returns false when the position is
    /// not addressable; callers must then fall back to [`Self::set_tempo`].
    fn set_tempo_marker(&self, marker: &TempoMarker) -> bool;

    /// Unconditional tempo set, the coarse fallback.
    fn set_tempo(&self, bpm: f64);

    /// Active loop region in beats, if looping is enabled.
    fn loop_region(&self) -> Option<(f64, f64)>;

    fn play(&self);

    fn stop(&self);

    /// Move the edit cursor (and optionally the playhead) to `time`.
    fn set_edit_cursor(&self, time: f64, seek_play: bool);

    /// Nudge the playback rate one step up.
    fn nudge_playrate_up(&self);

    /// Nudge the playback rate one step down.
    fn nudge_playrate_down(&self);

    /// Restore unity playback rate.
    fn reset_playrate(&self);

    fn begin_undo_block(&self);

    fn end_undo_block(&self, description: &str);

    /// Notify the host that timeline structure changed and views should
    /// refresh.
    fn update_timeline(&self);
}
