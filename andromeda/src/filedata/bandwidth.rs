use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::consts::BANDWIDTH_WINDOW;

/// Tracks recent flush throughput over a moving window, feeding the adaptive
/// dirty limit (Section 4.2, "Adaptive dirty limit"): `dirty_limit =
/// throughput * target_stall`.
#[derive(Debug)]
pub(crate) struct BandwidthMeasure {
	window: Duration,
	samples: VecDeque<(Instant, u64)>,
}

impl BandwidthMeasure {
	pub fn new() -> Self {
		Self::with_window(BANDWIDTH_WINDOW)
	}

	pub fn with_window(window: Duration) -> Self {
		Self { window, samples: VecDeque::new() }
	}

	/// Records that `bytes` were flushed at `now`.
	pub fn record(&mut self, now: Instant, bytes: u64) {
		self.samples.push_back((now, bytes));
		self.evict_stale(now);
	}

	fn evict_stale(&mut self, now: Instant) {
		while let Some(&(ts, _)) = self.samples.front() {
			if now.duration_since(ts) > self.window {
				self.samples.pop_front();
			} else {
				break;
			}
		}
	}

	/// Bytes per second over the current window. `0` if no samples are
	/// present or the oldest-to-newest span is degenerate.
	pub fn throughput(&mut self, now: Instant) -> f64 {
		self.evict_stale(now);
		if self.samples.len() < 2 {
			return self.samples.iter().map(|&(_, b)| b as f64).sum();
		}
		let total_bytes: u64 = self.samples.iter().map(|&(_, b)| b).sum();
		let oldest = self.samples.front().expect("checked len >= 2").0;
		let newest = self.samples.back().expect("checked len >= 2").0;
		let elapsed = newest.duration_since(oldest).as_secs_f64();
		if elapsed <= 0.0 {
			return total_bytes as f64;
		}
		total_bytes as f64 / elapsed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn throughput_is_zero_with_no_samples() {
		let mut measure = BandwidthMeasure::with_window(Duration::from_secs(1));
		assert_eq!(measure.throughput(Instant::now()), 0.0);
	}

	#[test]
	fn throughput_averages_over_the_window() {
		let mut measure = BandwidthMeasure::with_window(Duration::from_secs(10));
		let t0 = Instant::now();
		measure.record(t0, 1000);
		measure.record(t0 + Duration::from_secs(1), 1000);
		let throughput = measure.throughput(t0 + Duration::from_secs(1));
		assert!((throughput - 2000.0).abs() < 1.0);
	}

	#[test]
	fn stale_samples_fall_out_of_the_window() {
		let mut measure = BandwidthMeasure::with_window(Duration::from_secs(1));
		let t0 = Instant::now();
		measure.record(t0, 1000);
		let later = t0 + Duration::from_secs(5);
		measure.record(later, 500);
		assert_eq!(measure.throughput(later), 500.0);
	}
}
