//! One [`MediaBuffer`] per track kind: owns a [`wrts_mux::CmafMux`] and
//! turns ingested samples into CMAF fragments appended to a platform media
//! sink (§3 Lifecycle: "A Playback owns two MediaBuffers (audio, video),
//! each owning a CmafMux").
//!
//! The sink itself — a `SourceBuffer`/video element equivalent — is an
//! external collaborator (§1) and is therefore a trait, not a concrete
//! type: this crate only needs to know how to push bytes into it and read
//! back what it has buffered.

use bytes::Bytes;
use wrts_demux::{Sample, TrackKind};
use wrts_mux::{CmafMux, Protection, TrackInfo};

use crate::error::MediaBufferError;

/// The platform media sink's surface, as seen by a [`MediaBuffer`].
///
/// Implementations wrap a `SourceBuffer`/`ManagedSourceBuffer` (or, for a
/// headless client, a file/pipe). All methods are synchronous: appends are
/// fire-and-forget from this crate's point of view, matching the "only the
/// Playback owns the buffers" discipline in §5 — nothing here blocks on the
/// sink draining.
pub trait MediaSink {
	fn append_init_segment(&mut self, kind: TrackKind, data: Bytes) -> std::result::Result<(), MediaBufferError>;
	fn append_fragment(&mut self, kind: TrackKind, data: Bytes) -> std::result::Result<(), MediaBufferError>;

	/// Seconds. The earliest buffered position across both tracks.
	fn start_time(&self) -> f64;
	/// Seconds. The latest contiguous buffered position for `kind`.
	fn buffered_end(&self, kind: TrackKind) -> f64;
	/// Seconds. Current playhead.
	fn current_time(&self) -> f64;
	fn set_current_time(&mut self, time: f64);
	fn set_playback_rate(&mut self, rate: f64);
}

/// Owns the CMAF writer for one track and lazily emits its initialization
/// segment the first time a sample for it is seen.
pub struct MediaBuffer {
	kind: TrackKind,
	mux: Option<CmafMux>,
	protection: Option<Protection>,
	initialized: bool,
}

impl MediaBuffer {
	pub fn new(kind: TrackKind) -> Self {
		Self { kind, mux: None, protection: None, initialized: false }
	}

	pub fn kind(&self) -> TrackKind {
		self.kind
	}

	pub fn is_initialized(&self) -> bool {
		self.initialized
	}

	/// Bind the track's decoder configuration and (optional) content
	/// protection, writing the initialization segment to `sink`. Idempotent:
	/// a second call with the same track is a no-op, matching a Source that
	/// re-announces metadata without changing the effective track.
	pub fn initialize(&mut self, track: TrackInfo, protection: Option<Protection>, sink: &mut dyn MediaSink) -> std::result::Result<(), MediaBufferError> {
		if self.initialized {
			return Ok(());
		}
		let mux = CmafMux::new(track);
		let init = mux.init(protection.as_ref()).map_err(|e| MediaBufferError::AppendBufferIssue(e.to_string()))?;
		sink.append_init_segment(self.kind, init)?;
		self.mux = Some(mux);
		self.protection = protection;
		self.initialized = true;
		Ok(())
	}

	/// Write one fragment for `sample` and append it to `sink`.
	pub fn write_sample(&mut self, sample: &Sample, sink: &mut dyn MediaSink) -> std::result::Result<(), MediaBufferError> {
		let mux = self.mux.as_mut().ok_or(MediaBufferError::TrackWithoutMetadata)?;
		let fragment = mux.write(sample, self.protection.as_ref()).map_err(|e| MediaBufferError::AppendBufferIssue(e.to_string()))?;
		sink.append_fragment(self.kind, fragment)
	}
}

impl From<wrts_mux::Error> for MediaBufferError {
	fn from(err: wrts_mux::Error) -> Self {
		MediaBufferError::AppendBufferIssue(err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[derive(Default)]
	struct FakeSink {
		appended_init: HashMap<TrackKind, Bytes>,
		fragments: Vec<(TrackKind, Bytes)>,
		current_time: f64,
		rate: f64,
	}

	impl MediaSink for FakeSink {
		fn append_init_segment(&mut self, kind: TrackKind, data: Bytes) -> std::result::Result<(), MediaBufferError> {
			self.appended_init.insert(kind, data);
			Ok(())
		}
		fn append_fragment(&mut self, kind: TrackKind, data: Bytes) -> std::result::Result<(), MediaBufferError> {
			self.fragments.push((kind, data));
			Ok(())
		}
		fn start_time(&self) -> f64 {
			0.0
		}
		fn buffered_end(&self, _kind: TrackKind) -> f64 {
			0.0
		}
		fn current_time(&self) -> f64 {
			self.current_time
		}
		fn set_current_time(&mut self, time: f64) {
			self.current_time = time;
		}
		fn set_playback_rate(&mut self, rate: f64) {
			self.rate = rate;
		}
	}

	fn aac_track() -> TrackInfo {
		TrackInfo {
			codec: wrts_mux::Codec::Aac,
			config: Bytes::from_static(&[0x11, 0x90]),
			resolution: None,
			channels: Some(2),
			sample_rate: Some(48_000),
		}
	}

	#[test]
	fn write_before_initialize_fails_with_track_without_metadata() {
		let mut buf = MediaBuffer::new(TrackKind::Audio);
		let mut sink = FakeSink::default();
		let sample = Sample { time: 0, duration: 1024, data: Bytes::new(), composition_offset: None, is_key_frame: None, sub_samples: None };
		let err = buf.write_sample(&sample, &mut sink).unwrap_err();
		assert!(matches!(err, MediaBufferError::TrackWithoutMetadata));
	}

	#[test]
	fn initialize_then_write_appends_init_and_fragment() {
		let mut buf = MediaBuffer::new(TrackKind::Audio);
		let mut sink = FakeSink::default();
		buf.initialize(aac_track(), None, &mut sink).unwrap();
		assert!(sink.appended_init.contains_key(&TrackKind::Audio));

		let sample = Sample { time: 0, duration: 1024, data: Bytes::from_static(&[1, 2]), composition_offset: None, is_key_frame: None, sub_samples: None };
		buf.write_sample(&sample, &mut sink).unwrap();
		assert_eq!(sink.fragments.len(), 1);
	}

	#[test]
	fn initialize_is_idempotent() {
		let mut buf = MediaBuffer::new(TrackKind::Video);
		let mut sink = FakeSink::default();
		buf.initialize(aac_track(), None, &mut sink).unwrap();
		buf.initialize(aac_track(), None, &mut sink).unwrap();
		assert_eq!(sink.appended_init.len(), 1);
	}
}
