use bytes::Bytes;

/// The kind of a track, shared by the demuxer, the track model and the
/// metadata normalizer built on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
	Audio,
	Video,
	Data,
}

/// Per-sample encryption layout, present only on protected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSample {
	pub clear_bytes: u16,
	pub encrypted_bytes: u32,
}

/// One decoded media sample straight off the wire.
///
/// `duration` mirrors the wire representation: negative means "extendable up
/// to `abs(duration)`" and must be normalized by the `Source` before it is
/// handed to anything downstream (see `fixTimestamp` in wrts-core).
#[derive(Debug, Clone)]
pub struct Sample {
	pub time: u64,
	pub duration: i64,
	pub data: Bytes,
	pub composition_offset: Option<i32>,
	pub is_key_frame: Option<bool>,
	pub sub_samples: Option<Vec<SubSample>>,
}

impl Sample {
	pub fn end_time(&self) -> u64 {
		self.time.saturating_add(self.duration.max(0) as u64)
	}
}
