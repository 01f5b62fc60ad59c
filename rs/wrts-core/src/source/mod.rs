//! Source: ingests samples from a demuxer, repairs timestamps, tracks
//! selection state, and forwards to playback.
//!
//! [`Source`] is the shared trait; [`SourceBase`] holds the state common to
//! every variant (§4.4). Concrete wire transports live in
//! [`http_adaptive`], [`streaming`].

pub mod buffering;
pub mod http_adaptive;
pub mod rendition;
pub mod selection;
pub mod streaming;
pub mod timestamp;

use tokio::sync::{mpsc, watch};
use wrts_demux::{RtsDemux, Sample, TrackKind};

use crate::buffer_state::PlaybackStatus;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::metadata::Metadata;
use buffering::FirstSampleBuffer;
use selection::{Selection, TrackSelection};
use timestamp::{SkipEvent, TimestampRepair};

/// Query parameters a Source passes on `open`, per §6.
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
	pub audio: Option<TrackSelection>,
	pub video: Option<TrackSelection>,
	pub reliable: bool,
	/// Sent only on the first request, as `preload=<MIDDLE ms>`.
	pub preload_ms: Option<u32>,
}

/// A user-initiated change queued into a running [`Source::open`] loop.
///
/// Trait methods [`Source::set_track`]/[`Source::set_reliable`] mutate
/// `&mut self` directly and are only safe to call before `open` starts (or
/// on a Source that isn't currently open): once `open` is driving the
/// session, its future holds the only `&mut self` borrow for its lifetime.
/// A [`crate::player::Player`] reaches a running source through this
/// channel instead, and each `open` loop applies commands to itself
/// in-place (no externally observable borrow conflict).
#[derive(Debug, Clone)]
pub enum SourceCommand {
	SetTrack { kind: TrackKind, selection: Option<TrackSelection> },
	SetReliable(bool),
}

/// What a [`crate::player::Player`] subscribes a running [`Source`] to: the
/// Playing object's `BufferState` and `Stall` events (§4.5 startup step 5),
/// plus user commands and the lifecycle cancellation that closing the
/// Player propagates.
pub struct SourceControl {
	pub buffer_state: watch::Receiver<PlaybackStatus>,
	pub stall: mpsc::UnboundedReceiver<()>,
	pub commands: mpsc::UnboundedReceiver<SourceCommand>,
	pub cancel: CancelToken,
}

/// Callbacks a [`Source`] drives. Held by the owning [`crate::player::Player`].
pub trait SourceEvents {
	fn on_metadata(&mut self, metadata: &Metadata) {
		let _ = metadata;
	}
	fn on_track_change(&mut self, video_track_id: Option<u32>, audio_track_id: Option<u32>) {
		let _ = (video_track_id, audio_track_id);
	}
	fn on_sample(&mut self, kind: TrackKind, track_id: u32, sample: Sample) {
		let _ = (kind, track_id, sample);
	}
	fn on_data(&mut self, track_id: u32, time: u64, payload: serde_json::Value) {
		let _ = (track_id, time, payload);
	}
	fn on_audio_skipping(&mut self, delta_ms: u64) {
		let _ = delta_ms;
	}
	fn on_video_skipping(&mut self, delta_ms: u64) {
		let _ = delta_ms;
	}
}

/// Shared operations every Source variant exposes (§4.4's public contract).
#[async_trait::async_trait(?Send)]
pub trait Source {
	/// Begin play, returning once the Source finishes (error or close).
	async fn open(&mut self, url: url::Url, params: OpenParams, playing: bool, events: &mut dyn SourceEvents, control: SourceControl) -> Result<()>;

	/// `undefined` (`None`) selects automatic (MBR) control.
	fn set_track(&mut self, kind: TrackKind, selection: Option<TrackSelection>);

	/// Flips frame-skip permission; subclasses choose the wire representation.
	fn set_reliable(&mut self, reliable: bool);
}

/// State shared by every [`Source`] implementation.
pub struct SourceBase {
	pub demux: RtsDemux,
	pub metadata: Option<Metadata>,
	pub selection: Selection,
	pub buffering: FirstSampleBuffer,
	pub repair: TimestampRepair,
	pub reliable: bool,
}

impl SourceBase {
	pub fn new(demux: RtsDemux) -> Self {
		Self {
			demux,
			metadata: None,
			selection: Selection::new(),
			buffering: FirstSampleBuffer::new(),
			repair: TimestampRepair::new(),
			reliable: true,
		}
	}

	/// Apply timestamp repair and either buffer or forward one ingested
	/// sample, dispatching skip events as they occur.
	pub fn ingest_sample(&mut self, kind: TrackKind, track_id: u32, mut sample: Sample, events: &mut dyn SourceEvents) {
		if let Some(event) = self.repair.fix(kind, &mut sample) {
			dispatch_skip(events, event);
		}
		if kind == TrackKind::Video {
			if let Some(event) = self.repair.extend_video_to_close_gap(&mut sample) {
				dispatch_skip(events, event);
			}
		}
		if let Some(metadata) = &mut self.metadata {
			self.repair.ensure_live_time(&mut metadata.live_time, &sample);
		}

		if !self.selection.both_effective_known() {
			self.buffering.push(kind, track_id, sample);
			return;
		}

		events.on_sample(kind, track_id, sample);
	}

	/// Call once both effective tracks become known, to release anything
	/// accumulated by [`Self::ingest_sample`] while they weren't.
	pub fn flush_buffered(&mut self, events: &mut dyn SourceEvents) {
		for (kind, track_id, sample) in self.buffering.flush(&self.selection) {
			events.on_sample(kind, track_id, sample);
		}
	}

	/// Record which track ids are now effective for each kind (`None`
	/// mirrors the wire's "no track of this kind" sentinel, i.e. disabled),
	/// flushing any first-sample buffer once both are known.
	pub fn apply_track_change(&mut self, video_track_id: Option<u32>, audio_track_id: Option<u32>, events: &mut dyn SourceEvents) {
		let video = video_track_id.map(TrackSelection::Track).unwrap_or(TrackSelection::Disabled);
		let audio = audio_track_id.map(TrackSelection::Track).unwrap_or(TrackSelection::Disabled);
		self.selection.set_effective(TrackKind::Video, video);
		self.selection.set_effective(TrackKind::Audio, audio);
		if self.selection.both_effective_known() {
			self.flush_buffered(events);
		}
	}
}

fn dispatch_skip(events: &mut dyn SourceEvents, event: SkipEvent) {
	match event {
		SkipEvent::Audio(delta) => events.on_audio_skipping(delta),
		SkipEvent::Video(delta) => events.on_video_skipping(delta),
	}
}
