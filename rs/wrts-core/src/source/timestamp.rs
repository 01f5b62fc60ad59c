use std::collections::HashMap;

use tracing::info;
use wrts_demux::{Sample, TrackKind};

/// Audio gaps at or below this are left alone; anything larger is repaired
/// by holding playback at the last known time. See §8 boundary tests: a 7ms
/// hole is skipped, an 8ms hole is repaired.
const AUDIO_HOLE_TOLERANCE_MS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipEvent {
	Audio(u64),
	Video(u64),
}

/// Repairs per-kind sample timestamps so delivery to the sink is monotonic,
/// and tracks the live-edge corrections this has required.
#[derive(Debug, Default)]
pub struct TimestampRepair {
	current_time: HashMap<TrackKind, u64>,
	accumulated_correction_ms: u64,
}

impl TimestampRepair {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current_time(&self, kind: TrackKind) -> Option<u64> {
		self.current_time.get(&kind).copied()
	}

	/// Repair `sample`'s `time`/`duration` in place. Returns a skip event
	/// when a positive gap was closed.
	pub fn fix(&mut self, kind: TrackKind, sample: &mut Sample) -> Option<SkipEvent> {
		let extendable = sample.duration < 0;
		if extendable {
			sample.duration = sample.duration.abs();
		}

		let current = self.current_time.get(&kind).copied();
		let delta = current.map(|c| sample.time as i64 - c as i64).unwrap_or(0);

		let should_fix = match kind {
			TrackKind::Data => delta < 0,
			TrackKind::Audio => delta < 0 || delta > AUDIO_HOLE_TOLERANCE_MS,
			TrackKind::Video => true,
		};

		let mut event = None;
		if should_fix {
			if let Some(current) = current {
				if delta > 0 {
					event = Some(match kind {
						TrackKind::Audio => SkipEvent::Audio(delta as u64),
						_ => SkipEvent::Video(delta as u64),
					});
				}
				sample.time = current;
				sample.duration = (sample.duration + delta).max(1);
			}
		}

		let next = sample.time + sample.duration.max(0) as u64;
		self.current_time.insert(kind, next);
		event
	}

	/// If any other kind has advanced past `video_sample`'s new end time,
	/// stretch it to close the gap instead of leaving a hole at the live
	/// edge, emitting the equivalent of `onVideoSkipping(gap)`.
	pub fn extend_video_to_close_gap(&mut self, video_sample: &mut Sample) -> Option<SkipEvent> {
		let max_current = self.current_time.values().copied().max().unwrap_or(0);
		let gap = max_current as i64 - video_sample.end_time() as i64;
		if gap <= 0 {
			return None;
		}

		video_sample.duration += gap;
		self.current_time.insert(TrackKind::Video, video_sample.end_time());
		Some(SkipEvent::Video(gap as u64))
	}

	/// Raise `live_time` to at least `sample.time + sample.duration`,
	/// recording the upward correction.
	pub fn ensure_live_time(&mut self, live_time: &mut crate::metadata::LiveTimeAnchor, sample: &Sample) {
		let floor = sample.time + sample.duration.max(0) as u64;
		let before = live_time.now_ms();
		live_time.ensure_at_least(floor);
		let after = live_time.now_ms();
		if after > before {
			self.accumulated_correction_ms += after - before;
			info!(total_ms = self.accumulated_correction_ms, "accumulated liveTime correction");
		}
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;

	fn sample(time: u64, duration: i64) -> Sample {
		Sample { time, duration, data: Bytes::new(), composition_offset: None, is_key_frame: None, sub_samples: None }
	}

	#[test]
	fn audio_hole_of_exactly_seven_ms_is_not_repaired() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, 100);
		repair.fix(TrackKind::Audio, &mut first);

		let mut second = sample(107, 100);
		let event = repair.fix(TrackKind::Audio, &mut second);
		assert!(event.is_none());
		assert_eq!(second.time, 107);
	}

	#[test]
	fn audio_hole_of_eight_ms_is_repaired() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, 100);
		repair.fix(TrackKind::Audio, &mut first);

		let mut second = sample(108, 100);
		let event = repair.fix(TrackKind::Audio, &mut second);
		assert_eq!(event, Some(SkipEvent::Audio(8)));
		assert_eq!(second.time, 100);
		assert_eq!(second.duration, 108);
	}

	#[test]
	fn audio_overlap_is_always_repaired_regardless_of_magnitude() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, 100);
		repair.fix(TrackKind::Audio, &mut first);

		let mut second = sample(50, 100);
		let event = repair.fix(TrackKind::Audio, &mut second);
		assert!(event.is_none(), "overlaps (negative delta) never emit a skip event");
		assert_eq!(second.time, 100);
	}

	#[test]
	fn video_is_always_fixed() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, 40);
		repair.fix(TrackKind::Video, &mut first);

		let mut second = sample(41, 40);
		let event = repair.fix(TrackKind::Video, &mut second);
		assert_eq!(event, Some(SkipEvent::Video(1)));
		assert_eq!(second.time, 40);
	}

	#[test]
	fn data_only_fixed_on_overlap() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, 100);
		repair.fix(TrackKind::Data, &mut first);

		let mut ahead = sample(500, 100);
		assert!(repair.fix(TrackKind::Data, &mut ahead).is_none());
		assert_eq!(ahead.time, 500);

		let mut overlapping = sample(510, 100);
		let event = repair.fix(TrackKind::Data, &mut overlapping);
		assert!(event.is_none());
		assert_eq!(overlapping.time, 600);
	}

	#[test]
	fn negative_duration_marks_extendable_and_is_normalized_positive() {
		let mut repair = TimestampRepair::new();
		let mut first = sample(0, -40);
		repair.fix(TrackKind::Video, &mut first);
		assert_eq!(first.duration, 40);
	}

	#[test]
	fn video_stretches_to_close_a_gap_left_by_a_faster_track() {
		let mut repair = TimestampRepair::new();
		let mut audio = sample(0, 1000);
		repair.fix(TrackKind::Audio, &mut audio);

		let mut video = sample(0, 100);
		repair.fix(TrackKind::Video, &mut video);

		let event = repair.extend_video_to_close_gap(&mut video);
		assert_eq!(event, Some(SkipEvent::Video(900)));
		assert_eq!(video.duration, 1000);
	}
}
