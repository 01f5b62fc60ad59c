//! A headless stand-in for the browser's `SourceBuffer`/video element
//! (§1's "external collaborator"): writes every init segment and fragment
//! straight to disk and chases the live edge itself, since there's no real
//! playhead advancing `currentTime` for it.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use wrts_core::error::MediaBufferError;
use wrts_core::media_buffer::MediaSink;
use wrts_core::TrackKind;

fn dir_name(kind: TrackKind) -> &'static str {
	match kind {
		TrackKind::Audio => "audio",
		TrackKind::Video => "video",
		TrackKind::Data => "data",
	}
}

/// Writes `<output>/<audio|video>/init.mp4` once per track, then
/// `<output>/<audio|video>/<sequence>.m4s` per fragment.
///
/// There's no real decoder or clock driving playback here, so `current_time`
/// auto-advances to stay `target_latency` behind whichever track's buffered
/// end is furthest along, rather than being driven by a `timeupdate` tick.
pub struct FileSink {
	root: PathBuf,
	fragment_duration: Duration,
	target_latency: Duration,
	buffered_end: HashMap<TrackKind, f64>,
	sequence: HashMap<TrackKind, u64>,
	current_time: f64,
	playback_rate: f64,
}

impl FileSink {
	pub fn new(root: PathBuf, fragment_duration: Duration, target_latency: Duration) -> std::io::Result<Self> {
		for kind in [TrackKind::Audio, TrackKind::Video] {
			fs::create_dir_all(root.join(dir_name(kind)))?;
		}
		Ok(Self {
			root,
			fragment_duration,
			target_latency,
			buffered_end: HashMap::new(),
			sequence: HashMap::new(),
			current_time: 0.0,
			playback_rate: 1.0,
		})
	}

	pub fn playback_rate(&self) -> f64 {
		self.playback_rate
	}

	fn chase_live_edge(&mut self) {
		let end = self.buffered_end.values().copied().fold(f64::INFINITY, f64::min);
		if !end.is_finite() {
			return;
		}
		let target = (end - self.target_latency.as_secs_f64()).max(self.start_time());
		if self.current_time < target {
			self.current_time = target;
		}
	}
}

impl MediaSink for FileSink {
	fn append_init_segment(&mut self, kind: TrackKind, data: Bytes) -> Result<(), MediaBufferError> {
		let path = self.root.join(dir_name(kind)).join("init.mp4");
		fs::write(&path, &data).map_err(|e| MediaBufferError::AppendBufferIssue(e.to_string()))?;
		tracing::debug!(?kind, bytes = data.len(), path = %path.display(), "wrote init segment");
		Ok(())
	}

	fn append_fragment(&mut self, kind: TrackKind, data: Bytes) -> Result<(), MediaBufferError> {
		let seq = self.sequence.entry(kind).or_insert(0);
		let path = self.root.join(dir_name(kind)).join(format!("{seq:08}.m4s"));
		fs::write(&path, &data).map_err(|e| MediaBufferError::AppendBufferIssue(e.to_string()))?;
		*seq += 1;

		let end = self.buffered_end.entry(kind).or_insert(0.0);
		*end += self.fragment_duration.as_secs_f64();
		self.chase_live_edge();
		Ok(())
	}

	fn start_time(&self) -> f64 {
		0.0
	}

	fn buffered_end(&self, kind: TrackKind) -> f64 {
		self.buffered_end.get(&kind).copied().unwrap_or(0.0)
	}

	fn current_time(&self) -> f64 {
		self.current_time
	}

	fn set_current_time(&mut self, time: f64) {
		self.current_time = time;
	}

	fn set_playback_rate(&mut self, rate: f64) {
		self.playback_rate = rate;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fragments_advance_current_time_toward_the_live_edge() {
		let dir = tempdir();
		let mut sink = FileSink::new(dir.clone(), Duration::from_secs(2), Duration::from_millis(500)).unwrap();
		for _ in 0..3 {
			sink.append_fragment(TrackKind::Audio, Bytes::from_static(b"x")).unwrap();
			sink.append_fragment(TrackKind::Video, Bytes::from_static(b"x")).unwrap();
		}
		assert_eq!(sink.buffered_end(TrackKind::Audio), 6.0);
		assert!((sink.current_time() - 5.5).abs() < 1e-9);
		let _ = fs::remove_dir_all(&dir);
	}

	fn tempdir() -> PathBuf {
		let dir = std::env::temp_dir().join(format!("wrts-cli-sink-test-{:?}", std::thread::current().id()));
		let _ = fs::remove_dir_all(&dir);
		dir
	}
}
