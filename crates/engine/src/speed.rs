//! Transfer speed sampling.

use std::time::{Duration, Instant};

/// Sliding window over which speed is computed.
pub const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Minimum interval between emitted speed readings.
pub const SPEED_EMIT_INTERVAL: Duration = Duration::from_millis(500);

struct Sample {
    at: Instant,
    bytes: i64,
}

/// Sliding-window speed meter with throttled readings.
///
/// Workers record one sample per completed chunk; [`record`](Self::record)
/// hands back a bytes/sec reading at most once per emit interval.
pub struct SpeedMeter {
    window: Duration,
    emit_interval: Duration,
    samples: Vec<Sample>,
    last_emit: Option<Instant>,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(SPEED_WINDOW, SPEED_EMIT_INTERVAL)
    }
}

impl SpeedMeter {
    pub fn new(window: Duration, emit_interval: Duration) -> Self {
        Self {
            window,
            emit_interval,
            samples: Vec::new(),
            last_emit: None,
        }
    }

    /// Records a completed chunk of `bytes`; returns a bytes/sec reading
    /// when one is due, computed over the samples still inside the window.
    pub fn record(&mut self, bytes: i64) -> Option<f64> {
        let now = Instant::now();
        self.samples.push(Sample { at: now, bytes });

        if let Some(cutoff) = now.checked_sub(self.window) {
            self.samples.retain(|sample| sample.at >= cutoff);
        }

        if self
            .last_emit
            .is_some_and(|last| now.duration_since(last) < self.emit_interval)
        {
            return None;
        }
        self.last_emit = Some(now);

        let oldest = self.samples.first()?;
        let window_time = now.duration_since(oldest.at);
        if window_time.is_zero() {
            // A lone fresh sample has no measurable window yet.
            return None;
        }

        let total: i64 = self.samples.iter().map(|sample| sample.bytes).sum();
        Some(total as f64 / window_time.as_secs_f64())
    }

    /// Estimates time to drain `remaining_bytes` at the current rate.
    ///
    /// Returns `None` with fewer than two samples or a zero rate.
    pub fn eta(&self, remaining_bytes: i64) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }
        let first = self.samples.first()?;
        let last = self.samples.last()?;
        let elapsed = last.at.duration_since(first.at);
        if elapsed.is_zero() {
            return None;
        }

        let total: i64 = self.samples.iter().map(|sample| sample.bytes).sum();
        let speed = total as f64 / elapsed.as_secs_f64();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes.max(0) as f64 / speed))
    }

    /// Drops all samples.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_emit = None;
    }
}
