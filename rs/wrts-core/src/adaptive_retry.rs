use std::time::{Duration, Instant};

const STEP: Duration = Duration::from_millis(3000);
const CAP: Duration = Duration::from_millis(30000);

/// Rate-limits "up" probes: a rendition-up switch is only attempted once this
/// gate has been open for `try_delay` since the current trial started.
#[derive(Debug, Clone)]
pub struct AdaptiveRetry {
	try_delay: Duration,
	appreciation_time: Option<Instant>,
	success: bool,
}

impl Default for AdaptiveRetry {
	fn default() -> Self {
		Self { try_delay: STEP, appreciation_time: None, success: false }
	}
}

impl AdaptiveRetry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns whether an "up" probe may be attempted now. Starts the trial
	/// clock on first call; on success, shortens the delay for next time.
	pub fn try_now(&mut self, now: Instant) -> bool {
		if self.appreciation_time.is_none() {
			self.appreciation_time = Some(now);
		}
		if self.success {
			self.try_delay = self.try_delay.saturating_sub(STEP).max(STEP);
		}

		let elapsed = now.duration_since(self.appreciation_time.unwrap());
		if elapsed >= self.try_delay {
			self.success = true;
			self.appreciation_time = None;
			true
		} else {
			false
		}
	}

	/// A downshift or aborted probe: lengthen the delay before trying again.
	pub fn raise(&mut self) {
		self.appreciation_time = None;
		if self.success {
			self.success = false;
			self.try_delay = (self.try_delay + STEP).min(CAP);
		}
	}

	pub fn reset(&mut self) {
		self.try_delay = STEP;
		self.success = false;
		self.appreciation_time = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn try_fails_before_the_delay_elapses() {
		let mut retry = AdaptiveRetry::new();
		let start = Instant::now();
		assert!(!retry.try_now(start));
		assert!(!retry.try_now(start + Duration::from_millis(100)));
	}

	#[test]
	fn try_succeeds_once_delay_elapses_and_shortens_next_delay() {
		let mut retry = AdaptiveRetry::new();
		let start = Instant::now();
		assert!(retry.try_now(start + STEP));
		assert!(retry.success);

		// A fresh trial after a success should need less time than STEP.
		assert!(retry.try_now(start + STEP));
	}

	#[test]
	fn raise_after_success_lengthens_the_delay_and_clears_success() {
		let mut retry = AdaptiveRetry::new();
		let start = Instant::now();
		assert!(retry.try_now(start + STEP));
		retry.raise();
		assert!(!retry.success);
		assert_eq!(retry.try_delay, STEP * 2);
	}

	#[test]
	fn raise_caps_the_delay() {
		let mut retry = AdaptiveRetry::new();
		for _ in 0..20 {
			retry.success = true;
			retry.raise();
		}
		assert!(retry.try_delay <= CAP);
	}

	#[test]
	fn reset_restores_initial_state() {
		let mut retry = AdaptiveRetry::new();
		retry.try_now(Instant::now() + STEP);
		retry.raise();
		retry.reset();
		assert_eq!(retry.try_delay, STEP);
		assert!(!retry.success);
	}
}
