//! Owns the two [`MediaBuffer`]s (audio, video) and the dynamic-rate /
//! buffer-telemetry logic a [`crate::player::Player`] drives its buffer
//! state machine from (§4.7).

use wrts_demux::{Sample, TrackKind};
use wrts_mux::{Protection, TrackInfo};

use crate::buffer_state::{buffer_amount_ms, dynamic_rate, BufferState};
use crate::environment::Environment;
use crate::error::MediaBufferError;
use crate::media_buffer::{MediaBuffer, MediaSink};

/// Two [`MediaBuffer`]s and the telemetry derived from their sink.
pub struct Playback {
	audio: MediaBuffer,
	video: MediaBuffer,
	rate_changes_glitch: bool,
}

impl Playback {
	pub fn new(environment: &Environment) -> Self {
		Self {
			audio: MediaBuffer::new(TrackKind::Audio),
			video: MediaBuffer::new(TrackKind::Video),
			rate_changes_glitch: environment.rate_changes_glitch(),
		}
	}

	fn buffer(&mut self, kind: TrackKind) -> Option<&mut MediaBuffer> {
		match kind {
			TrackKind::Audio => Some(&mut self.audio),
			TrackKind::Video => Some(&mut self.video),
			TrackKind::Data => None,
		}
	}

	pub fn initialize_track(&mut self, kind: TrackKind, track: TrackInfo, protection: Option<Protection>, sink: &mut dyn MediaSink) -> std::result::Result<(), MediaBufferError> {
		match self.buffer(kind) {
			Some(buf) => buf.initialize(track, protection, sink),
			None => Ok(()),
		}
	}

	/// Forward an ingested sample to its buffer. Data-track samples are
	/// dropped: they never reach the media sink (§4.1, delivered via
	/// `onData` instead).
	pub fn write_sample(&mut self, kind: TrackKind, sample: &Sample, sink: &mut dyn MediaSink) -> std::result::Result<(), MediaBufferError> {
		match self.buffer(kind) {
			Some(buf) => buf.write_sample(sample, sink),
			None => Ok(()),
		}
	}

	/// The more advanced contiguous buffered position across the two tracks
	/// that are actually initialized (whichever is further behind the live
	/// edge governs playback).
	pub fn end_time(&self, sink: &dyn MediaSink) -> f64 {
		match (self.audio.is_initialized(), self.video.is_initialized()) {
			(true, true) => sink.buffered_end(TrackKind::Audio).min(sink.buffered_end(TrackKind::Video)),
			(true, false) => sink.buffered_end(TrackKind::Audio),
			(false, true) => sink.buffered_end(TrackKind::Video),
			(false, false) => 0.0,
		}
	}

	/// `bufferAmount = max(0, round((endTime - max(currentTime, startTime)) * 1000))`.
	pub fn buffer_amount_ms(&self, sink: &dyn MediaSink) -> u64 {
		buffer_amount_ms(sink.start_time(), sink.current_time(), self.end_time(sink))
	}

	/// Apply the state's dynamic playback rate, unless the sink glitches on
	/// rate changes (§9 design note).
	pub fn apply_dynamic_rate(&self, state: BufferState, sink: &mut dyn MediaSink) {
		if self.rate_changes_glitch {
			return;
		}
		sink.set_playback_rate(dynamic_rate(state));
	}

	/// `goLive`: seek to `max(startTime, endTime - MIDDLE/1000)` (§4.7).
	pub fn go_live(&self, middle_ms: u32, sink: &mut dyn MediaSink) {
		let end_time = sink.buffered_end(TrackKind::Audio).max(sink.buffered_end(TrackKind::Video));
		let target = (end_time - middle_ms as f64 / 1000.0).max(sink.start_time());
		sink.set_current_time(target);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use std::collections::HashMap;

	#[derive(Default)]
	struct FakeSink {
		start: f64,
		end: HashMap<TrackKind, f64>,
		current: f64,
		rate: f64,
	}

	impl MediaSink for FakeSink {
		fn append_init_segment(&mut self, _kind: TrackKind, _data: Bytes) -> std::result::Result<(), MediaBufferError> {
			Ok(())
		}
		fn append_fragment(&mut self, _kind: TrackKind, _data: Bytes) -> std::result::Result<(), MediaBufferError> {
			Ok(())
		}
		fn start_time(&self) -> f64 {
			self.start
		}
		fn buffered_end(&self, kind: TrackKind) -> f64 {
			self.end.get(&kind).copied().unwrap_or(0.0)
		}
		fn current_time(&self) -> f64 {
			self.current
		}
		fn set_current_time(&mut self, time: f64) {
			self.current = time;
		}
		fn set_playback_rate(&mut self, rate: f64) {
			self.rate = rate;
		}
	}

	#[test]
	fn go_live_seeks_to_middle_behind_the_end() {
		let playback = Playback::new(&Environment::new());
		let mut sink = FakeSink { end: [(TrackKind::Audio, 10.0), (TrackKind::Video, 10.0)].into_iter().collect(), ..Default::default() };
		playback.go_live(500, &mut sink);
		assert!((sink.current - 9.5).abs() < 1e-9);
	}

	#[test]
	fn dynamic_rate_is_suppressed_on_glitch_prone_sinks() {
		let playback = Playback { audio: MediaBuffer::new(TrackKind::Audio), video: MediaBuffer::new(TrackKind::Video), rate_changes_glitch: true };
		let mut sink = FakeSink::default();
		playback.apply_dynamic_rate(BufferState::High, &mut sink);
		assert_eq!(sink.rate, 0.0, "rate must not be touched when the sink glitches");
	}
}
