use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::warn;
use wrts_mux::Scheme;

use crate::track::{Track, TrackKind};

#[derive(Debug, Clone)]
pub struct Pssh {
	pub drm_system_id: String,
	pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProtectionEntry {
	pub scheme: Scheme,
	pub key_id: [u8; 16],
	pub iv: Option<[u8; 16]>,
	pub pssh: Vec<Pssh>,
}

/// A monotonic, wall-advancing estimate of the server's live edge.
///
/// Reading it returns `value + elapsed since the anchor was taken`; it never
/// decreases on its own, only when an explicit correction raises the anchor.
#[derive(Debug, Clone, Copy)]
pub struct LiveTimeAnchor {
	value_ms: u64,
	wall_time: Instant,
}

impl LiveTimeAnchor {
	pub fn new(value_ms: u64) -> Self {
		Self { value_ms, wall_time: Instant::now() }
	}

	pub fn now_ms(&self) -> u64 {
		self.value_ms + self.wall_time.elapsed().as_millis() as u64
	}

	/// Re-anchor at `now_ms()`, adding `delta_ms` (used for RTT compensation
	/// and HEAD-probe decrements during frame-skip).
	pub fn adjust(&mut self, delta_ms: i64) {
		let now = self.now_ms() as i64;
		self.value_ms = (now + delta_ms).max(0) as u64;
		self.wall_time = Instant::now();
	}

	/// Raise the anchor so that `now_ms() >= floor_ms`, logging the
	/// correction. No-op if already above `floor_ms`.
	pub fn ensure_at_least(&mut self, floor_ms: u64) {
		let now = self.now_ms();
		if floor_ms > now {
			warn!(correction_ms = floor_ms - now, "liveTime anchor corrected upward");
			self.value_ms = floor_ms;
			self.wall_time = Instant::now();
		}
	}
}

/// Normalized stream description: tracks sorted by descending bandwidth,
/// content-protection entries keyed by key ID, and the live-clock anchor.
#[derive(Debug, Clone)]
pub struct Metadata {
	pub live_time: LiveTimeAnchor,
	tracks: Vec<Track>,
	by_id: HashMap<u32, usize>,
	audio_order: Vec<usize>,
	video_order: Vec<usize>,
	data_order: Vec<usize>,
	pub content_protection: HashMap<String, ProtectionEntry>,
}

impl Metadata {
	/// Collect `tracks`, stable-sort by descending bandwidth, rebuild the
	/// per-kind lists and the `up`/`down` chains. Duplicate IDs keep their
	/// first occurrence.
	pub fn fix(live_time_ms: u64, mut tracks: Vec<Track>, content_protection: HashMap<String, ProtectionEntry>) -> Self {
		tracks.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

		let mut deduped: Vec<Track> = Vec::with_capacity(tracks.len());
		let mut seen = std::collections::HashSet::new();
		for track in tracks {
			if seen.insert(track.id) {
				deduped.push(track);
			}
		}

		let mut by_id = HashMap::with_capacity(deduped.len());
		for (idx, track) in deduped.iter().enumerate() {
			by_id.insert(track.id, idx);
		}

		let mut audio_order = Vec::new();
		let mut video_order = Vec::new();
		let mut data_order = Vec::new();
		for (idx, track) in deduped.iter().enumerate() {
			match track.kind {
				TrackKind::Audio => audio_order.push(idx),
				TrackKind::Video => video_order.push(idx),
				TrackKind::Data => data_order.push(idx),
			}
		}

		for order in [&audio_order, &video_order, &data_order] {
			link_chain(&mut deduped, order);
		}

		Self {
			live_time: LiveTimeAnchor::new(live_time_ms),
			tracks: deduped,
			by_id,
			audio_order,
			video_order,
			data_order,
			content_protection,
		}
	}

	pub fn track(&self, id: u32) -> Option<&Track> {
		self.by_id.get(&id).map(|&idx| &self.tracks[idx])
	}

	pub fn audio_tracks(&self) -> impl Iterator<Item = &Track> {
		self.audio_order.iter().map(|&idx| &self.tracks[idx])
	}

	pub fn video_tracks(&self) -> impl Iterator<Item = &Track> {
		self.video_order.iter().map(|&idx| &self.tracks[idx])
	}

	pub fn data_tracks(&self) -> impl Iterator<Item = &Track> {
		self.data_order.iter().map(|&idx| &self.tracks[idx])
	}

	pub fn up(&self, track: &Track) -> Option<&Track> {
		track.up.map(|idx| &self.tracks[idx])
	}

	pub fn down(&self, track: &Track) -> Option<&Track> {
		track.down.map(|idx| &self.tracks[idx])
	}
}

/// Link `up`/`down` pointers (stored as `Vec` indices) along `order`, which
/// is already sorted head = highest bandwidth.
fn link_chain(tracks: &mut [Track], order: &[usize]) {
	for window in order.windows(2) {
		let (higher, lower) = (window[0], window[1]);
		tracks[higher].down = Some(lower);
		tracks[lower].up = Some(higher);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn track(id: u32, kind: TrackKind, bandwidth: u64) -> Track {
		Track::new(id, kind, "test", bandwidth)
	}

	#[test]
	fn fix_sorts_by_descending_bandwidth_and_links_chain() {
		let tracks = vec![
			track(1, TrackKind::Video, 400_000),
			track(2, TrackKind::Video, 800_000),
			track(3, TrackKind::Audio, 64_000),
		];
		let meta = Metadata::fix(0, tracks, HashMap::new());

		let video: Vec<_> = meta.video_tracks().map(|t| t.id).collect();
		assert_eq!(video, vec![2, 1]);

		let top = meta.track(2).unwrap();
		assert!(meta.up(top).is_none());
		let bottom = meta.down(top).unwrap();
		assert_eq!(bottom.id, 1);
		assert!(meta.down(bottom).is_none());
		assert_eq!(meta.up(bottom).unwrap().id, 2);
	}

	#[test]
	fn fix_dedupes_by_id_keeping_first_occurrence() {
		let mut first = track(1, TrackKind::Audio, 100_000);
		first.codec = "first".to_string();
		let mut dup = track(1, TrackKind::Audio, 50_000);
		dup.codec = "second".to_string();

		let meta = Metadata::fix(0, vec![first, dup], HashMap::new());
		assert_eq!(meta.audio_tracks().count(), 1);
		assert_eq!(meta.track(1).unwrap().codec, "first");
	}

	#[test]
	fn live_time_anchor_advances_with_wall_clock() {
		let anchor = LiveTimeAnchor::new(1_000);
		let a = anchor.now_ms();
		let b = anchor.now_ms();
		assert!(b >= a);
	}
}
