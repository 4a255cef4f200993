//! Beat/time translation between the wall clock and musical timelines.
//!
//! Everything here is pure math: microsecond timestamps, beats-per-minute
//! conversions, and the linear [`Timeline`] mapping that both the session
//! snapshot and the launch planner are built on.

use core::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

pub const MICROS_PER_SECOND: f64 = 1.0e6;

/// Wall-clock timestamp or duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Micros(pub i64);

impl Micros {
    pub const ZERO: Micros = Micros(0);

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * MICROS_PER_SECOND).round() as i64)
    }

    pub fn from_millis(millis: f64) -> Self {
        Self((millis * 1.0e3).round() as i64)
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND
    }

    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1.0e3
    }
}

impl Add for Micros {
    type Output = Micros;
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0 + rhs.0)
    }
}

impl AddAssign for Micros {
    fn add_assign(&mut self, rhs: Micros) {
        self.0 += rhs.0;
    }
}

impl Sub for Micros {
    type Output = Micros;
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl SubAssign for Micros {
    fn sub_assign(&mut self, rhs: Micros) {
        self.0 -= rhs.0;
    }
}

impl Mul<i64> for Micros {
    type Output = Micros;
    fn mul(self, rhs: i64) -> Micros {
        Micros(self.0 * rhs)
    }
}

impl Neg for Micros {
    type Output = Micros;
    fn neg(self) -> Micros {
        Micros(-self.0)
    }
}

/// Convert a beat span to wall-clock time at the given tempo.
pub fn beats_to_micros(beats: f64, bpm: f64) -> Micros {
    Micros((beats * 60.0 * MICROS_PER_SECOND / bpm).round() as i64)
}

/// Convert a wall-clock span to beats at the given tempo.
pub fn micros_to_beats(micros: Micros, bpm: f64) -> f64 {
    micros.as_seconds() * bpm / 60.0
}

/// Reduce an absolute beat into `[0, quantum)`.
///
/// Defined for negative beats (Euclidean remainder), so a position one
/// eighth before beat zero has phase `quantum - 0.125`.
pub fn phase(beat: f64, quantum: f64) -> f64 {
    if quantum <= 0.0 {
        return 0.0;
    }
    beat.rem_euclid(quantum)
}

/// Linear beat/time mapping: a tempo plus one (beat, time) anchor point.
///
/// This is the cross-clock translation primitive. A session snapshot is a
/// `Timeline` plus transport state; re-mapping operations move the anchor,
/// tempo changes re-anchor at the change point so the beat there stays put.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    tempo: f64,
    origin_beat: f64,
    origin_time: Micros,
}

impl Timeline {
    pub fn new(tempo: f64, origin_beat: f64, origin_time: Micros) -> Self {
        Self {
            tempo,
            origin_beat,
            origin_time,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Absolute beat at a wall-clock time. Negative before the origin.
    pub fn beat_at_time(&self, time: Micros) -> f64 {
        self.origin_beat + micros_to_beats(time - self.origin_time, self.tempo)
    }

    /// Phase of [`Self::beat_at_time`] within the quantum.
    pub fn phase_at_time(&self, time: Micros, quantum: f64) -> f64 {
        phase(self.beat_at_time(time), quantum)
    }

    /// Wall-clock time at which the given beat occurs.
    pub fn time_at_beat(&self, beat: f64) -> Micros {
        self.origin_time + beats_to_micros(beat - self.origin_beat, self.tempo)
    }

    /// Change tempo at `at`, keeping the beat at `at` unchanged.
    pub fn set_tempo(&mut self, bpm: f64, at: Micros) {
        self.origin_beat = self.beat_at_time(at);
        self.origin_time = at;
        self.tempo = bpm;
    }

    /// Hard re-map so that `beat` occurs exactly at `time`.
    ///
    /// This is the authority-push primitive: it discards the previous
    /// mapping outright. Followers use the request variants on the session
    /// snapshot instead.
    pub fn force_beat_at_time(&mut self, beat: f64, time: Micros) {
        self.origin_beat = beat;
        self.origin_time = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_phase_wraps_negative_beats() {
        assert_abs_diff_eq!(phase(5.25, 4.0), 1.25, epsilon = 1e-12);
        assert_abs_diff_eq!(phase(-0.125, 4.0), 3.875, epsilon = 1e-12);
        assert_eq!(phase(1.0, 0.0), 0.0);
    }

    #[test]
    fn test_beats_micros_round_trip() {
        let us = beats_to_micros(3.5, 140.0);
        assert_abs_diff_eq!(micros_to_beats(us, 140.0), 3.5, epsilon = 1e-6);
    }

    #[test]
    fn test_set_tempo_keeps_beat_continuous() {
        let mut tl = Timeline::new(120.0, 0.0, Micros::ZERO);
        let at = Micros::from_seconds(2.0);
        let beat_before = tl.beat_at_time(at);
        tl.set_tempo(90.0, at);
        assert_abs_diff_eq!(tl.beat_at_time(at), beat_before, epsilon = 1e-9);
        // one second later beats advance at the new tempo
        let later = at + Micros::from_seconds(1.0);
        assert_abs_diff_eq!(tl.beat_at_time(later), beat_before + 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_force_beat_at_time_is_exact() {
        let mut tl = Timeline::new(120.0, 0.0, Micros::ZERO);
        let at = Micros::from_seconds(1.234);
        tl.force_beat_at_time(7.5, at);
        assert_abs_diff_eq!(tl.beat_at_time(at), 7.5, epsilon = 1e-12);
        assert_eq!(tl.time_at_beat(7.5), at);
    }

    proptest! {
        #[test]
        fn prop_beat_time_round_trip(beat in 0.0f64..1.0e6, bpm in 20.0f64..999.0) {
            let tl = Timeline::new(bpm, 0.0, Micros::ZERO);
            let back = tl.beat_at_time(tl.time_at_beat(beat));
            // timestamps are integral micros, so tolerance scales with tempo
            prop_assert!((back - beat).abs() < bpm / 60.0 * 1e-6 + 1e-9);
        }
    }
}
