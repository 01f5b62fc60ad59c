/// Playback buffer health, driving the dynamic rate and stall handling.
///
/// `None` is only ever the pre-play state: once playback leaves it, the
/// machine never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
	None,
	Low,
	Ok,
	High,
}

/// What a [`crate::source::http_adaptive::HttpAdaptiveSource`] is subscribed
/// to (§4.5 startup step 5): the current buffer state plus whether a
/// (re)buffering episode is in progress. The latter distinguishes the
/// frame-skip policy (active while buffering) from the last-chance-rendition
/// policy (active once LOW but no longer buffering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStatus {
	pub state: BufferState,
	pub buffering: bool,
}

impl Default for PlaybackStatus {
	fn default() -> Self {
		Self { state: BufferState::None, buffering: true }
	}
}

/// Buffer-amount thresholds, in milliseconds. `middle` is always
/// `low + (high - low) / 2`, recomputed whenever either bound changes.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
	pub low: u32,
	pub high: u32,
}

impl Default for Thresholds {
	fn default() -> Self {
		Self { low: 150, high: 550 }
	}
}

impl Thresholds {
	pub fn middle(&self) -> u32 {
		self.low + (self.high - self.low) / 2
	}
}

/// `bufferAmount = max(0, round((endTime - max(currentTime, startTime)) *
/// 1000))`, inputs in seconds, output in milliseconds.
pub fn buffer_amount_ms(start_time: f64, current_time: f64, end_time: f64) -> u64 {
	let behind = end_time - current_time.max(start_time);
	(behind * 1000.0).round().max(0.0) as u64
}

/// Evaluate the next [`BufferState`] given the current one and a fresh
/// `bufferAmount` reading. Called on every playback progress / time-update.
pub fn next_state(current: BufferState, buffer_amount_ms: u64, thresholds: Thresholds) -> BufferState {
	let middle = thresholds.middle() as u64;
	let low = thresholds.low as u64;
	let high = thresholds.high as u64;

	if current == BufferState::None {
		if buffer_amount_ms > high {
			return BufferState::High;
		}
		if buffer_amount_ms > middle {
			return BufferState::Ok;
		}
		return BufferState::None;
	}

	if buffer_amount_ms > high {
		return BufferState::High;
	}

	if buffer_amount_ms > low {
		return match current {
			BufferState::Low => if buffer_amount_ms > middle { BufferState::Ok } else { BufferState::Low },
			BufferState::High => if buffer_amount_ms < middle { BufferState::Ok } else { BufferState::High },
			BufferState::Ok => BufferState::Ok,
			BufferState::None => unreachable!("handled above"),
		};
	}

	BufferState::Low
}

/// Dynamic playback rate for `state`, skipped entirely on sinks known to
/// glitch on rate changes (see the platform-capability design note).
pub fn dynamic_rate(state: BufferState) -> f64 {
	match state {
		BufferState::High => 1.08,
		BufferState::Low => 0.92,
		BufferState::Ok | BufferState::None => 1.0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stays_in_none_below_middle() {
		let t = Thresholds::default();
		assert_eq!(next_state(BufferState::None, 0, t), BufferState::None);
		assert_eq!(next_state(BufferState::None, t.low as u64, t), BufferState::None);
	}

	#[test]
	fn leaves_none_once_buffering_crosses_middle() {
		let t = Thresholds::default();
		let middle = t.middle() as u64;
		assert_eq!(next_state(BufferState::None, middle + 1, t), BufferState::Ok);
	}

	#[test]
	fn high_hysteresis_requires_dropping_below_middle() {
		let t = Thresholds::default();
		let middle = t.middle() as u64;
		// Between LOW and MIDDLE while coming from HIGH: drops to OK.
		assert_eq!(next_state(BufferState::High, t.low as u64 + 1, t), BufferState::Ok);
		assert_eq!(next_state(BufferState::High, middle - 1, t), BufferState::Ok);
		assert_eq!(next_state(BufferState::High, middle + 1, t), BufferState::High);
	}

	#[test]
	fn low_hysteresis_requires_rising_above_middle() {
		let t = Thresholds::default();
		let middle = t.middle() as u64;
		assert_eq!(next_state(BufferState::Low, t.low as u64 + 1, t), BufferState::Low);
		assert_eq!(next_state(BufferState::Low, middle + 1, t), BufferState::Ok);
	}

	#[test]
	fn anything_above_high_threshold_jumps_to_high() {
		let t = Thresholds::default();
		assert_eq!(next_state(BufferState::Ok, t.high as u64 + 1, t), BufferState::High);
	}

	#[test]
	fn rate_never_simultaneously_above_and_below_one() {
		for state in [BufferState::None, BufferState::Low, BufferState::Ok, BufferState::High] {
			let rate = dynamic_rate(state);
			assert!(!(rate > 1.0 && rate < 1.0));
		}
		assert_eq!(dynamic_rate(BufferState::Low), 0.92);
		assert_eq!(dynamic_rate(BufferState::High), 1.08);
	}
}
