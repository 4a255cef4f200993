//! Drift measurement and the correction decision.
//!
//! Each quantum the engine measures the phase difference between the host
//! timeline and the session timeline, in milliseconds, and asks the
//! corrector what to do about it. Exactly one of three postures applies:
//! the master pushes the session to the host (a hard re-map), a plain
//! follower pulls the host toward the session (playrate nudges with
//! hysteresis), and a non-synchronized instance does nothing.

/// Correction engages when the phase error exceeds this many milliseconds.
pub const BASE_SYNC_TOLERANCE_MS: f64 = 3.0;
/// Phases this close to the next beat are treated as that beat.
pub const BEAT_SNAP_TOLERANCE: f64 = 0.02;
/// Relative tempo difference below which tempos count as equal.
pub const TEMPO_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftAction {
    None,
    /// Re-map the session so `beat` falls on the current host time.
    ForcePush { beat: f64 },
    /// Re-tune the session to the host tempo, anchored at `at_beat`.
    RetuneSession { bpm: f64, at_beat: f64 },
    /// Slow the host playrate one step.
    NudgeRateDown,
    /// Speed the host playrate one step.
    NudgeRateUp,
    /// Phase error back inside tolerance: restore unity playrate.
    ReleaseNudge,
}

/// Everything the corrector needs to know about one processing quantum.
#[derive(Debug, Clone, Copy)]
pub struct DriftFrame {
    /// Host beat phase in `[0, 1)`, loop wraps already absorbed.
    pub local_phase: f64,
    /// Session beat phase in `[0, 1)`.
    pub session_phase: f64,
    /// Absolute session beat.
    pub session_beat: f64,
    pub local_bpm: f64,
    pub session_bpm: f64,
    /// Host beat phase at the active tempo marker, for retune anchoring.
    pub marker_phase: f64,
    pub has_marker: bool,
    /// Buffer duration in milliseconds.
    pub frame_ms: f64,
    pub is_master: bool,
    pub is_puppet: bool,
    /// A tempo change is still in flight through the host worker.
    pub tempo_request_pending: bool,
    pub session_playing: bool,
    pub past_safety_window: bool,
    /// A quantized launch countdown is still running.
    pub launch_pending: bool,
}

#[derive(Debug)]
pub struct DriftCorrector {
    sync_tolerance_ms: f64,
    engaged: bool,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self {
            sync_tolerance_ms: BASE_SYNC_TOLERANCE_MS,
            engaged: false,
        }
    }

    pub fn tolerance_ms(&self) -> f64 {
        self.sync_tolerance_ms
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Phase error in milliseconds, positive when the host is ahead.
    fn diff_ms(frame: &DriftFrame) -> f64 {
        frame.local_phase * 60_000.0 / frame.local_bpm
            - frame.session_phase * 60_000.0 / frame.session_bpm
    }

    pub fn evaluate(&mut self, frame: &DriftFrame) -> DriftAction {
        // corrections measured against a mapping that is about to change
        // would chase a stale target
        if frame.launch_pending || frame.tempo_request_pending {
            return DriftAction::None;
        }

        let diff = Self::diff_ms(frame);
        let beat_ms = (60_000.0 / frame.session_bpm).floor();
        // near a full beat the phases sit on adjacent beats, not apart
        let in_band = diff.abs() > self.sync_tolerance_ms
            && diff.abs() < beat_ms - (2.0 * frame.frame_ms).ceil();

        // an engaged playrate nudge always resolves before any other kind
        // of correction, in any mode
        if self.engaged {
            let plain_follower = frame.is_puppet && !frame.is_master;
            if diff.abs() < self.sync_tolerance_ms || !plain_follower {
                self.engaged = false;
                self.sync_tolerance_ms =
                    (self.sync_tolerance_ms + 1.0).min(BASE_SYNC_TOLERANCE_MS);
                return DriftAction::ReleaseNudge;
            }
            // nudge already issued, let it work
            return DriftAction::None;
        }

        if frame.is_master {
            if frame.session_playing && frame.past_safety_window && in_band {
                let beat = snap_to_beat(frame.local_phase, frame.session_beat);
                return DriftAction::ForcePush { beat };
            }
            return DriftAction::None;
        }

        if !frame.is_puppet {
            return DriftAction::None;
        }

        let tempo_off =
            (frame.local_bpm - frame.session_bpm).abs() > frame.session_bpm * TEMPO_TOLERANCE * 1.5;
        if tempo_off && frame.has_marker {
            let at_beat = snap_to_beat(frame.marker_phase, frame.session_beat);
            return DriftAction::RetuneSession {
                bpm: frame.local_bpm,
                at_beat,
            };
        }

        // followers only correct when both phases sit on the same side of
        // the beat; half a beat apart the nudge direction is ambiguous
        let same_side = diff.abs() > self.sync_tolerance_ms && diff.abs() < beat_ms * 0.5;
        if frame.session_playing && frame.past_safety_window && same_side {
            self.engaged = true;
            self.sync_tolerance_ms = (self.sync_tolerance_ms - 1.0).max(1.0);
            return if diff > 0.0 {
                DriftAction::NudgeRateDown
            } else {
                DriftAction::NudgeRateUp
            };
        }

        DriftAction::None
    }

    /// Clear hysteresis state on stop or seek. Returns whether a nudge was
    /// engaged, in which case the caller must restore unity playrate.
    pub fn reset(&mut self) -> bool {
        let was_engaged = self.engaged;
        self.engaged = false;
        self.sync_tolerance_ms = BASE_SYNC_TOLERANCE_MS;
        was_engaged
    }
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute session beat nearest to `session_beat` whose phase is
/// `local_phase`, with near-beat phases snapped to the boundary.
fn snap_to_beat(local_phase: f64, session_beat: f64) -> f64 {
    let push = if local_phase > 1.0 - BEAT_SNAP_TOLERANCE {
        0.0
    } else {
        local_phase
    };
    let mut beat = session_beat.floor() + push;
    if beat - session_beat > 0.5 {
        beat -= 1.0;
    } else if session_beat - beat > 0.5 {
        beat += 1.0;
    }
    beat
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn frame() -> DriftFrame {
        DriftFrame {
            local_phase: 0.5,
            session_phase: 0.5,
            session_beat: 20.5,
            local_bpm: 120.0,
            session_bpm: 120.0,
            marker_phase: 0.0,
            has_marker: true,
            frame_ms: 10.0,
            is_master: false,
            is_puppet: true,
            tempo_request_pending: false,
            session_playing: true,
            past_safety_window: true,
            launch_pending: false,
        }
    }

    // 0.01 beats at 120bpm = 5ms, just over the 3ms base tolerance
    fn drifted() -> DriftFrame {
        DriftFrame {
            local_phase: 0.51,
            ..frame()
        }
    }

    #[test]
    fn test_in_tolerance_does_nothing() {
        let mut corrector = DriftCorrector::new();
        assert_eq!(corrector.evaluate(&frame()), DriftAction::None);
    }

    #[test]
    fn test_master_pushes_session_to_host() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            is_master: true,
            ..drifted()
        };
        match corrector.evaluate(&frame) {
            DriftAction::ForcePush { beat } => {
                assert_abs_diff_eq!(beat, 20.51, epsilon = 1e-12)
            }
            other => panic!("expected force push, got {other:?}"),
        }
        // hard push, no hysteresis
        assert!(!corrector.is_engaged());
    }

    #[test]
    fn test_master_waits_out_safety_window() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            is_master: true,
            past_safety_window: false,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&frame), DriftAction::None);
    }

    #[test]
    fn test_adjacent_beat_phases_are_not_drift() {
        let mut corrector = DriftCorrector::new();
        // host a hair before the beat, session a hair after: ~499ms apart
        let frame = DriftFrame {
            is_master: true,
            local_phase: 0.999,
            session_phase: 0.001,
            ..frame()
        };
        assert_eq!(corrector.evaluate(&frame), DriftAction::None);
    }

    #[test]
    fn test_follower_nudges_once_and_releases() {
        let mut corrector = DriftCorrector::new();

        // host ahead: slow it down
        assert_eq!(corrector.evaluate(&drifted()), DriftAction::NudgeRateDown);
        assert!(corrector.is_engaged());
        assert_abs_diff_eq!(corrector.tolerance_ms(), 2.0, epsilon = 1e-12);

        // still drifting: the nudge is already working, stay quiet
        assert_eq!(corrector.evaluate(&drifted()), DriftAction::None);

        // back inside tolerance: release and relax
        assert_eq!(corrector.evaluate(&frame()), DriftAction::ReleaseNudge);
        assert!(!corrector.is_engaged());
        assert_abs_diff_eq!(corrector.tolerance_ms(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_follower_behind_nudges_up() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            local_phase: 0.49,
            ..frame()
        };
        assert_eq!(corrector.evaluate(&frame), DriftAction::NudgeRateUp);
    }

    #[test]
    fn test_tolerance_floor_is_one_ms() {
        let mut corrector = DriftCorrector::new();
        for _ in 0..5 {
            corrector.evaluate(&drifted());
            // force release by presenting an aligned frame
            corrector.evaluate(&frame());
        }
        // engage tightens, release relaxes: never below 1ms
        for _ in 0..5 {
            corrector.evaluate(&drifted());
            assert!(corrector.tolerance_ms() >= 1.0);
            corrector.reset();
        }
    }

    #[test]
    fn test_tempo_mismatch_retunes_session() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            local_bpm: 100.0,
            session_bpm: 120.0,
            marker_phase: 0.0,
            ..frame()
        };
        match corrector.evaluate(&frame) {
            DriftAction::RetuneSession { bpm, at_beat } => {
                assert_abs_diff_eq!(bpm, 100.0, epsilon = 1e-12);
                assert_abs_diff_eq!(at_beat, 20.0, epsilon = 1e-12);
            }
            other => panic!("expected retune, got {other:?}"),
        }
    }

    #[test]
    fn test_tiny_tempo_difference_is_ignored() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            local_bpm: 120.0001,
            ..frame()
        };
        assert_eq!(corrector.evaluate(&frame), DriftAction::None);
    }

    #[test]
    fn test_pending_work_suppresses_correction() {
        let mut corrector = DriftCorrector::new();
        let launching = DriftFrame {
            launch_pending: true,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&launching), DriftAction::None);

        let retuning = DriftFrame {
            tempo_request_pending: true,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&retuning), DriftAction::None);
    }

    #[test]
    fn test_non_puppet_is_pass_through() {
        let mut corrector = DriftCorrector::new();
        let frame = DriftFrame {
            is_puppet: false,
            local_bpm: 90.0,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&frame), DriftAction::None);
    }

    #[test]
    fn test_master_promotion_releases_engaged_nudge() {
        let mut corrector = DriftCorrector::new();
        assert_eq!(corrector.evaluate(&drifted()), DriftAction::NudgeRateDown);
        assert!(corrector.is_engaged());

        // the user asserts authority while the nudge is still working:
        // the nudge is released first, even though the drift persists
        let master = DriftFrame {
            is_master: true,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&master), DriftAction::ReleaseNudge);
        assert!(!corrector.is_engaged());

        // only now may the master push
        assert!(matches!(
            corrector.evaluate(&master),
            DriftAction::ForcePush { .. }
        ));
    }

    #[test]
    fn test_leaving_puppet_mode_releases_engaged_nudge() {
        let mut corrector = DriftCorrector::new();
        corrector.evaluate(&drifted());
        assert!(corrector.is_engaged());

        let detached = DriftFrame {
            is_puppet: false,
            ..drifted()
        };
        assert_eq!(corrector.evaluate(&detached), DriftAction::ReleaseNudge);
        assert!(!corrector.is_engaged());
        assert_eq!(corrector.evaluate(&detached), DriftAction::None);
    }

    #[test]
    fn test_reset_reports_engaged_nudge() {
        let mut corrector = DriftCorrector::new();
        assert!(!corrector.reset());
        corrector.evaluate(&drifted());
        assert!(corrector.reset());
        assert_abs_diff_eq!(corrector.tolerance_ms(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_snap_near_beat_boundary() {
        // local phase just shy of the next beat snaps onto it
        assert_abs_diff_eq!(snap_to_beat(0.995, 21.002), 21.0, epsilon = 1e-12);
        // and nearest-beat adjustment keeps the push within half a beat
        assert_abs_diff_eq!(snap_to_beat(0.9, 21.05), 20.9, epsilon = 1e-12);
    }
}
