//! Beat-discontinuity tracking across loop wraps and seeks.
//!
//! The host playhead jumps backwards at a loop boundary while the session
//! beat keeps advancing. Rather than re-mapping the session on every wrap,
//! the tracker records where the playhead jumped from and where it landed
//! and presents an *apparent* phase that stays continuous through the
//! wrap. A free seek outside a loop cannot be absorbed this way and is
//! reported so the caller can re-seat the session mapping once.

use crate::clock::phase;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Discontinuity {
    None,
    /// Backward jump contained in the active loop; absorbed locally.
    LoopWrap,
    /// Jump outside any loop. `phase` is the landing beat phase the
    /// session must be re-mapped to.
    FreeSeek { phase: f64 },
}

#[derive(Debug, Default)]
pub struct JumpOffsetTracker {
    prev_beat: Option<f64>,
    jump_offset: f64,
    land_offset: f64,
}

impl JumpOffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host beat phase with any absorbed loop wrap undone, in `[0, 1)`.
    pub fn apparent_phase(&self, beat: f64) -> f64 {
        phase(phase(beat, 1.0) - self.land_offset + self.jump_offset, 1.0)
    }

    /// Feed the host beat for this quantum and classify any jump since the
    /// last one. The beat is always recorded; classification only happens
    /// while `armed`, so startup jitter inside the post-start settle
    /// window never plants an offset or triggers a re-seat.
    pub fn observe(
        &mut self,
        beat: f64,
        loop_region: Option<(f64, f64)>,
        armed: bool,
    ) -> Discontinuity {
        let prev = self.prev_beat.replace(beat);
        let prev = match prev {
            Some(p) => p,
            None => return Discontinuity::None,
        };

        let jumped = beat < prev || (beat - prev).abs() > 1.0;
        if !jumped || !armed {
            return Discontinuity::None;
        }

        if let Some((start, end)) = loop_region {
            if beat >= start && beat < end && prev >= start {
                // stack the wrap on top of any offsets already in effect
                self.jump_offset = self.apparent_phase(prev);
                self.land_offset = phase(beat, 1.0);
                return Discontinuity::LoopWrap;
            }
        }

        self.jump_offset = 0.0;
        self.land_offset = 0.0;
        Discontinuity::FreeSeek {
            phase: phase(beat, 1.0),
        }
    }

    pub fn reset(&mut self) {
        self.prev_beat = None;
        self.jump_offset = 0.0;
        self.land_offset = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_forward_motion_is_not_a_jump() {
        let mut tracker = JumpOffsetTracker::new();
        assert_eq!(tracker.observe(0.0, None, true), Discontinuity::None);
        assert_eq!(tracker.observe(0.25, None, true), Discontinuity::None);
        assert_eq!(tracker.observe(0.99, None, true), Discontinuity::None);
        assert_abs_diff_eq!(tracker.apparent_phase(0.99), 0.99, epsilon = 1e-12);
    }

    #[test]
    fn test_loop_wrap_keeps_apparent_phase_continuous() {
        let mut tracker = JumpOffsetTracker::new();
        tracker.observe(3.85, Some((0.0, 4.0)), true);
        let before = tracker.apparent_phase(3.95);
        tracker.observe(3.95, Some((0.0, 4.0)), true);

        // wrap back to the loop start
        assert_eq!(tracker.observe(0.05, Some((0.0, 4.0)), true), Discontinuity::LoopWrap);
        // phase presented at the landing point equals the phase at the
        // jump point, so the drift diff sees no discontinuity
        assert_abs_diff_eq!(tracker.apparent_phase(0.05), before, epsilon = 1e-12);

        // and keeps advancing at beat rate afterwards
        let later = tracker.apparent_phase(0.15);
        assert_abs_diff_eq!(later, phase(before + 0.1, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_second_wrap_stacks_on_first() {
        let mut tracker = JumpOffsetTracker::new();
        let region = Some((0.0, 2.0));
        tracker.observe(1.9, region, true);
        let first = tracker.apparent_phase(1.95);
        tracker.observe(1.95, region, true);
        tracker.observe(0.1, region, true);
        assert_abs_diff_eq!(tracker.apparent_phase(0.1), first, epsilon = 1e-12);

        tracker.observe(1.95, region, true);
        let second = tracker.apparent_phase(1.95);
        tracker.observe(0.3, region, true);
        assert_abs_diff_eq!(tracker.apparent_phase(0.3), second, epsilon = 1e-12);
    }

    #[test]
    fn test_seek_outside_loop_is_free() {
        let mut tracker = JumpOffsetTracker::new();
        tracker.observe(3.9, Some((0.0, 4.0)), true);
        match tracker.observe(17.25, Some((0.0, 4.0)), true) {
            Discontinuity::FreeSeek { phase } => {
                assert_abs_diff_eq!(phase, 0.25, epsilon = 1e-12)
            }
            other => panic!("expected free seek, got {other:?}"),
        }
        // offsets cleared: apparent phase is the raw phase again
        assert_abs_diff_eq!(tracker.apparent_phase(17.25), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_backward_seek_without_loop_is_free() {
        let mut tracker = JumpOffsetTracker::new();
        tracker.observe(8.0, None, true);
        assert!(matches!(
            tracker.observe(2.5, None, true),
            Discontinuity::FreeSeek { .. }
        ));
    }

    #[test]
    fn test_unarmed_jump_is_recorded_but_not_classified() {
        let mut tracker = JumpOffsetTracker::new();
        tracker.observe(3.95, Some((0.0, 4.0)), false);
        // a wrap during the settle window plants nothing
        assert_eq!(
            tracker.observe(0.05, Some((0.0, 4.0)), false),
            Discontinuity::None
        );
        assert_abs_diff_eq!(tracker.apparent_phase(0.05), 0.05, epsilon = 1e-12);

        // the beat was still recorded: once armed, ordinary forward motion
        // from the landing point is not mistaken for a jump
        assert_eq!(
            tracker.observe(0.15, Some((0.0, 4.0)), true),
            Discontinuity::None
        );
        // and a later wrap is classified normally
        tracker.observe(3.95, Some((0.0, 4.0)), true);
        assert_eq!(
            tracker.observe(0.05, Some((0.0, 4.0)), true),
            Discontinuity::LoopWrap
        );
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut tracker = JumpOffsetTracker::new();
        tracker.observe(3.95, Some((0.0, 4.0)), true);
        tracker.observe(0.05, Some((0.0, 4.0)), true);
        tracker.reset();
        assert_abs_diff_eq!(tracker.apparent_phase(0.5), 0.5, epsilon = 1e-12);
        // first observation after reset is never a jump
        assert_eq!(tracker.observe(0.5, None, true), Discontinuity::None);
    }
}
