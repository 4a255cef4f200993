//! Sample-clock to wall-clock regression filter.
//!
//! Per-buffer timestamps taken directly from the system clock jitter with
//! scheduling noise. The filter fits a line through recent
//! (sample position, wall clock) pairs and predicts the host time for the
//! current sample position from that fit, which converges to the true
//! sample clock rate and rejects per-callback jitter.

use crate::clock::Micros;

const NUM_POINTS: usize = 512;

pub struct HostTimeFilter {
    points: Vec<(f64, f64)>,
    next: usize,
}

impl HostTimeFilter {
    pub fn new() -> Self {
        Self {
            points: Vec::with_capacity(NUM_POINTS),
            next: 0,
        }
    }

    /// Drop all accumulated points. Call on sample-rate or buffer-size
    /// changes and before a quantized launch.
    pub fn reset(&mut self) {
        self.points.clear();
        self.next = 0;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }

    /// Record `(sample_time, now)` and return the filtered host time for
    /// `sample_time`.
    pub fn sample_time_to_host_time(&mut self, sample_time: f64, now: Micros) -> Micros {
        let point = (sample_time, now.0 as f64);
        if self.points.len() < NUM_POINTS {
            self.points.push(point);
        } else {
            self.points[self.next] = point;
        }
        self.next = (self.next + 1) % NUM_POINTS;

        let (slope, intercept) = fit(&self.points);
        Micros((slope * sample_time + intercept).round() as i64)
    }
}

impl Default for HostTimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinary least squares over the stored points.
fn fit(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in points {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x) * (x - mean_x);
    }

    if denominator == 0.0 {
        (0.0, mean_y)
    } else {
        let slope = numerator / denominator;
        (slope, mean_y - slope * mean_x)
    }
}
