use wrts_demux::{Sample, TrackKind};

use super::selection::{Selection, TrackSelection};

struct Pending {
	track_id: u32,
	kind: TrackKind,
	sample: Sample,
}

/// Accumulates samples arriving before both effective tracks are known, so
/// none are lost while the Source is still waiting to find out which
/// rendition the server settled on.
#[derive(Default)]
pub struct FirstSampleBuffer {
	pending: Vec<Pending>,
	start_time: Option<u64>,
	end_time: u64,
}

impl FirstSampleBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, kind: TrackKind, track_id: u32, sample: Sample) {
		let start = sample.time;
		let end = sample.end_time();
		self.start_time = Some(self.start_time.map_or(start, |s| s.min(start)));
		self.end_time = self.end_time.max(end);
		self.pending.push(Pending { track_id, kind, sample });
	}

	pub fn start_time(&self) -> Option<u64> {
		self.start_time
	}

	pub fn end_time(&self) -> u64 {
		self.end_time
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Flush in track-id order once both effective tracks are known,
	/// dropping samples for tracks that turned out to be inactive.
	pub fn flush(&mut self, selection: &Selection) -> Vec<(TrackKind, u32, Sample)> {
		self.pending.sort_by_key(|p| p.track_id);
		self.start_time = None;
		self.end_time = 0;

		std::mem::take(&mut self.pending)
			.into_iter()
			.filter(|p| match selection.effective(p.kind) {
				Some(TrackSelection::Disabled) => false,
				Some(TrackSelection::Track(id)) => id == p.track_id,
				Some(TrackSelection::Automatic) => true,
				None => false,
			})
			.map(|p| (p.kind, p.track_id, p.sample))
			.collect()
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
	fn flush_orders_by_track_id_and_drops_inactive_tracks() {
		let mut buf = FirstSampleBuffer::new();
		buf.push(TrackKind::Video, 2, sample(0, 40));
		buf.push(TrackKind::Audio, 1, sample(0, 20));

		let mut selection = Selection::new();
		selection.set_effective(TrackKind::Audio, TrackSelection::Disabled);
		selection.set_effective(TrackKind::Video, TrackSelection::Track(2));

		let flushed = buf.flush(&selection);
		assert_eq!(flushed.len(), 1);
		assert_eq!(flushed[0].1, 2);
	}

	#[test]
	fn aggregate_span_tracks_min_start_and_max_end() {
		let mut buf = FirstSampleBuffer::new();
		buf.push(TrackKind::Audio, 1, sample(100, 50));
		buf.push(TrackKind::Video, 2, sample(50, 200));
		assert_eq!(buf.start_time(), Some(50));
		assert_eq!(buf.end_time(), 250);
	}
}
