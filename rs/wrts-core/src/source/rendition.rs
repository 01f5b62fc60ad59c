//! Pure decision functions for rendition selection and frame-skip, kept free
//! of any transport so the policy itself is directly testable (§8 seed
//! scenarios #1, #3, #4).

use crate::adaptive_retry::AdaptiveRetry;
use crate::buffer_state::BufferState;
use crate::metadata::Metadata;
use crate::track::{Resolution, Track};

/// One rendition-selection decision (§4.5 "Rendition selection").
pub fn select_rendition<'a>(
	metadata: &'a Metadata,
	current: &'a Track,
	audio_bandwidth: u64,
	recv_byte_rate: u64,
	aborted_or_stalled: bool,
	up_probe_succeeded: bool,
	state: BufferState,
	max_resolution: Option<Resolution>,
	adaptive_retry: &mut AdaptiveRetry,
) -> &'a Track {
	let mut track = current;

	if aborted_or_stalled {
		if let Some(lower) = metadata.down(track) {
			track = lower;
		}
		while track.bandwidth + audio_bandwidth > recv_byte_rate {
			match metadata.down(track) {
				Some(lower) => track = lower,
				None => break,
			}
		}
		adaptive_retry.raise();
	} else if up_probe_succeeded {
		track = metadata.up(track).unwrap_or(track);
	} else if state == BufferState::Low {
		track = metadata.down(track).unwrap_or(track);
	}

	if let Some(max) = max_resolution {
		while let Some(res) = track.resolution {
			if res.width <= max.width && res.height <= max.height {
				break;
			}
			match metadata.down(track) {
				Some(lower) => track = lower,
				None => break,
			}
		}
	}

	track
}

/// `delay = liveTime - currentTime`. Refuses to skip when
/// `max_sequence_duration_ms` is unknown (§8 boundary). Returns the sequence
/// to HEAD-probe next, clamped below any earlier failed `prev_candidate`.
pub fn frame_skip_candidate(n: u64, max_sequence_duration_ms: Option<u64>, delay_ms: i64, prev_candidate: Option<u64>) -> Option<u64> {
	let max_sequence_duration_ms = max_sequence_duration_ms?;
	if max_sequence_duration_ms == 0 || delay_ms <= max_sequence_duration_ms as i64 {
		return None;
	}

	let steps = delay_ms as u64 / max_sequence_duration_ms;
	let candidate = n + steps;
	Some(match prev_candidate {
		Some(prev) if prev > 0 => candidate.min(prev - 1),
		_ => candidate,
	})
}

/// Byte length for an "up" bandwidth-emulation `Range` request. Never issued
/// when `extra_byte_rate <= 0` (§8 boundary).
pub fn up_probe_range_len(extra_byte_rate_bps: i64, video_time_delta_ms: u64) -> Option<u64> {
	if extra_byte_rate_bps <= 0 {
		return None;
	}
	Some(((extra_byte_rate_bps as f64 * video_time_delta_ms as f64) / 1000.0).ceil() as u64)
}

/// Stretch a last-chance single-frame sample's duration to cover the whole
/// sequence window, returning the amount stretched (for `onVideoSkipping`).
pub fn stretch_to_sequence_duration(duration_ms: &mut i64, max_sequence_duration_ms: u64) -> u64 {
	let stretch = max_sequence_duration_ms.saturating_sub((*duration_ms).max(0) as u64);
	*duration_ms += stretch as i64;
	stretch
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::track::TrackKind;

	fn ladder() -> Metadata {
		let tracks = vec![
			Track::new(10, TrackKind::Video, "h264", 800_000),
			Track::new(11, TrackKind::Video, "h264", 400_000),
			Track::new(20, TrackKind::Audio, "aac", 64_000),
		];
		Metadata::fix(0, tracks, HashMap::new())
	}

	#[test]
	fn scenario_1_first_decision_steps_down_under_low_state() {
		let metadata = ladder();
		let top = metadata.track(10).unwrap();
		let mut retry = AdaptiveRetry::new();

		let chosen = select_rendition(&metadata, top, 64_000, 600_000, false, false, BufferState::Low, None, &mut retry);
		assert_eq!(chosen.id, 11);
	}

	#[test]
	fn scenario_1_successful_up_probe_adopts_the_higher_rendition() {
		let metadata = ladder();
		let bottom = metadata.track(11).unwrap();
		let mut retry = AdaptiveRetry::new();

		let chosen = select_rendition(&metadata, bottom, 64_000, 600_000, false, true, BufferState::Ok, None, &mut retry);
		assert_eq!(chosen.id, 10);
	}

	#[test]
	fn aborted_request_steps_down_and_raises_retry() {
		let metadata = ladder();
		let top = metadata.track(10).unwrap();
		let mut retry = AdaptiveRetry::new();
		retry.try_now(std::time::Instant::now() + std::time::Duration::from_millis(3000));
		assert!(retry.success);

		let chosen = select_rendition(&metadata, top, 64_000, 600_000, true, false, BufferState::Ok, None, &mut retry);
		assert_eq!(chosen.id, 11);
		assert!(!retry.success, "raise() must clear success");
	}

	#[test]
	fn scenario_3_delay_over_budget_targets_n_plus_two() {
		let candidate = frame_skip_candidate(100, Some(1000), 2500, None);
		assert_eq!(candidate, Some(102));
	}

	#[test]
	fn frame_skip_refuses_without_a_known_max_sequence_duration() {
		assert_eq!(frame_skip_candidate(100, None, 2500, None), None);
	}

	#[test]
	fn frame_skip_refuses_when_delay_is_within_budget() {
		assert_eq!(frame_skip_candidate(100, Some(1000), 900, None), None);
	}

	#[test]
	fn scenario_4_last_chance_rendition_stretches_to_sequence_duration() {
		let mut duration = 40i64;
		let stretch = stretch_to_sequence_duration(&mut duration, 1000);
		assert_eq!(stretch, 960);
		assert_eq!(duration, 1000);
	}

	#[test]
	fn up_probe_range_is_never_issued_at_or_below_zero_extra_byte_rate() {
		assert_eq!(up_probe_range_len(0, 40), None);
		assert_eq!(up_probe_range_len(-1, 40), None);
		assert!(up_probe_range_len(1000, 40).is_some());
	}
}
