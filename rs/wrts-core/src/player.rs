//! Orchestrator (§4.7, §5): owns one [`Source`], one [`Playback`] and the
//! cached [`Metadata`], and drives the buffer state machine, the shared
//! timeout slot, `goLive` reconciliation and the close sequence.
//!
//! A running [`Player::run`] passes [`Source::open`] a [`Bridge`] that only
//! holds a channel sender, never a borrow of the Player itself — the same
//! problem [`crate::source::SourceCommand`] solves for a `Source`'s
//! `set_track`/`set_reliable`: if `open`'s future held `&mut Player`
//! directly, nothing else could touch the Player for the run's whole
//! lifetime. Instead every source callback and every host notification
//! (seek, waiting, track change, stop) funnels through `run`'s own select
//! loop, which is the sole place the Player's state is mutated.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wrts_demux::{Sample, TrackKind};
use wrts_mux::{Codec, Protection as MuxProtection, Pssh as MuxPssh, TrackInfo};

use crate::buffer_state::{next_state, BufferState, PlaybackStatus, Thresholds};
use crate::cancel::CancelToken;
use crate::environment::Environment;
use crate::error::{Error, MediaBufferError, Result, TimeoutError};
use crate::media_buffer::MediaSink;
use crate::metadata::{Metadata, ProtectionEntry};
use crate::playback::Playback;
use crate::source::selection::TrackSelection;
use crate::source::{OpenParams, Source, SourceCommand, SourceControl, SourceEvents};
use crate::track::Track;

/// A host (video element / embedding application) notification, sent
/// through [`PlayerHandle::host_events`] while [`Player::run`] is in flight.
#[derive(Debug, Clone, Copy)]
pub enum HostEvent {
	/// The media source finished opening; starts the Connection timeout.
	MediaSourceOpen,
	/// `waiting`: playback stalled on an empty buffer.
	Waiting,
	/// `canplay`: playback can resume after a stall.
	CanPlay,
	/// `timeupdate` / any other progress tick; re-evaluates buffer state.
	TimeUpdate,
	/// The user dragged the seek bar to `requested_time` (seconds).
	Seek { requested_time: f64 },
}

/// Callbacks a [`Player`] drives. All methods default to a no-op so a host
/// implements only what it needs.
pub trait PlayerObserver {
	fn on_metadata(&mut self, metadata: &Metadata) {
		let _ = metadata;
	}
	fn on_state(&mut self, state: BufferState) {
		let _ = state;
	}
	fn on_stall(&mut self) {}
	fn on_resume(&mut self) {}
	fn on_go_live(&mut self) {}
	fn on_audio_skipping(&mut self, delta_ms: u64) {
		let _ = delta_ms;
	}
	fn on_video_skipping(&mut self, delta_ms: u64) {
		let _ = delta_ms;
	}
	fn on_data(&mut self, track_id: u32, time: u64, payload: serde_json::Value) {
		let _ = (track_id, time, payload);
	}
	/// Called exactly once per `run`, whatever the outcome (§5: "All error
	/// paths must complete `onStop` exactly once").
	fn on_stop(&mut self, err: Option<&Error>) {
		let _ = err;
	}
}

/// No-op observer, used when a caller doesn't need any of the callbacks.
#[derive(Default)]
pub struct NullObserver;
impl PlayerObserver for NullObserver {}

/// What a caller holds onto to drive a running [`Player`]: user/host events,
/// Source commands (track/reliability changes), and the cancellation that
/// tears the whole session down.
#[derive(Clone)]
pub struct PlayerHandle {
	pub host_events: mpsc::UnboundedSender<HostEvent>,
	pub commands: mpsc::UnboundedSender<SourceCommand>,
	pub cancel: CancelToken,
}

impl PlayerHandle {
	pub fn stop(&self) {
		self.cancel.cancel();
	}

	pub fn set_track(&self, kind: TrackKind, selection: Option<TrackSelection>) {
		let _ = self.commands.send(SourceCommand::SetTrack { kind, selection });
	}

	pub fn set_reliable(&self, reliable: bool) {
		let _ = self.commands.send(SourceCommand::SetReliable(reliable));
	}

	pub fn seek(&self, requested_time: f64) {
		let _ = self.host_events.send(HostEvent::Seek { requested_time });
	}

	pub fn waiting(&self) {
		let _ = self.host_events.send(HostEvent::Waiting);
	}

	pub fn can_play(&self) {
		let _ = self.host_events.send(HostEvent::CanPlay);
	}

	pub fn media_source_open(&self) {
		let _ = self.host_events.send(HostEvent::MediaSourceOpen);
	}

	pub fn time_update(&self) {
		let _ = self.host_events.send(HostEvent::TimeUpdate);
	}
}

/// Which deadline currently occupies the one shared timeout slot (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
	Start,
	Connection,
	Data,
}

impl TimeoutKind {
	fn into_error(self) -> TimeoutError {
		match self {
			TimeoutKind::Start => TimeoutError::StartTimeout,
			TimeoutKind::Connection => TimeoutError::ConnectionTimeout,
			TimeoutKind::Data => TimeoutError::DataTimeout,
		}
	}
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
		None => std::future::pending().await,
	}
}

/// One [`SourceEvents`] callback, relayed from [`Bridge`] to [`Player::run`]'s
/// select loop instead of applied in place (see module docs).
enum SourceCallback {
	Metadata(Metadata),
	TrackChange { video_track_id: Option<u32>, audio_track_id: Option<u32> },
	Sample { kind: TrackKind, track_id: u32, sample: Sample },
	Data { track_id: u32, time: u64, payload: serde_json::Value },
	AudioSkipping(u64),
	VideoSkipping(u64),
}

/// The [`SourceEvents`] implementation handed to [`Source::open`]. Holds
/// nothing but a sender: it never borrows the owning [`Player`].
struct Bridge {
	tx: mpsc::UnboundedSender<SourceCallback>,
}

impl SourceEvents for Bridge {
	fn on_metadata(&mut self, metadata: &Metadata) {
		let _ = self.tx.send(SourceCallback::Metadata(metadata.clone()));
	}
	fn on_track_change(&mut self, video_track_id: Option<u32>, audio_track_id: Option<u32>) {
		let _ = self.tx.send(SourceCallback::TrackChange { video_track_id, audio_track_id });
	}
	fn on_sample(&mut self, kind: TrackKind, track_id: u32, sample: Sample) {
		let _ = self.tx.send(SourceCallback::Sample { kind, track_id, sample });
	}
	fn on_data(&mut self, track_id: u32, time: u64, payload: serde_json::Value) {
		let _ = self.tx.send(SourceCallback::Data { track_id, time, payload });
	}
	fn on_audio_skipping(&mut self, delta_ms: u64) {
		let _ = self.tx.send(SourceCallback::AudioSkipping(delta_ms));
	}
	fn on_video_skipping(&mut self, delta_ms: u64) {
		let _ = self.tx.send(SourceCallback::VideoSkipping(delta_ms));
	}
}

/// Owns the buffer state machine, lifecycle and user events; ties a
/// [`Source`], a [`Playback`] and the cached [`Metadata`] together.
pub struct Player {
	environment: Environment,
	thresholds: Thresholds,
	idle_timeout: Duration,
	reliable: bool,

	playback: Playback,
	metadata: Option<Metadata>,
	state: BufferState,
	buffering: bool,
	stalled: bool,

	observer: Box<dyn PlayerObserver>,

	buffer_state_tx: watch::Sender<PlaybackStatus>,
	buffer_state_rx: watch::Receiver<PlaybackStatus>,
	stall_tx: mpsc::UnboundedSender<()>,
	stall_rx: Option<mpsc::UnboundedReceiver<()>>,
	command_tx: mpsc::UnboundedSender<SourceCommand>,
	command_rx: Option<mpsc::UnboundedReceiver<SourceCommand>>,
	host_tx: mpsc::UnboundedSender<HostEvent>,
	host_rx: Option<mpsc::UnboundedReceiver<HostEvent>>,
	cancel: CancelToken,
}

impl Player {
	pub fn new(environment: Environment) -> Self {
		Self::with_observer(environment, Box::new(NullObserver))
	}

	pub fn with_observer(environment: Environment, observer: Box<dyn PlayerObserver>) -> Self {
		let (buffer_state_tx, buffer_state_rx) = watch::channel(PlaybackStatus::default());
		let (stall_tx, stall_rx) = mpsc::unbounded_channel();
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		let (host_tx, host_rx) = mpsc::unbounded_channel();
		Self {
			playback: Playback::new(&environment),
			environment,
			thresholds: Thresholds::default(),
			idle_timeout: Duration::from_millis(14_000),
			reliable: true,
			metadata: None,
			state: BufferState::None,
			buffering: true,
			stalled: false,
			observer,
			buffer_state_tx,
			buffer_state_rx,
			stall_tx,
			stall_rx: Some(stall_rx),
			command_tx,
			command_rx: Some(command_rx),
			host_tx,
			host_rx: Some(host_rx),
			cancel: CancelToken::new(),
		}
	}

	pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
		self.thresholds = thresholds;
		self
	}

	pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
		self.idle_timeout = Duration::from_millis(ms);
		self
	}

	pub fn with_reliable(mut self, reliable: bool) -> Self {
		self.reliable = reliable;
		self
	}

	pub fn environment(&self) -> &Environment {
		&self.environment
	}

	pub fn state(&self) -> BufferState {
		self.state
	}

	/// A cloneable set of channels to drive this Player with while [`Self::run`]
	/// is in flight. Must be obtained before calling `run`.
	pub fn handle(&self) -> PlayerHandle {
		PlayerHandle { host_events: self.host_tx.clone(), commands: self.command_tx.clone(), cancel: self.cancel.clone() }
	}

	/// Run one session against `source`, feeding ingested samples into
	/// `sink` through this Player's [`Playback`]. Resolves once the Source
	/// closes, a timeout fires, or [`PlayerHandle::stop`] is called.
	///
	/// Panics if called more than once on the same Player (the internal
	/// channel receivers are moved out on the first call).
	pub async fn run(&mut self, mut source: Box<dyn Source>, sink: &mut dyn MediaSink, url: url::Url, mut params: OpenParams) -> Result<()> {
		params.reliable = self.reliable;
		let stall_rx = self.stall_rx.take().expect("Player::run called twice");
		let command_rx = self.command_rx.take().expect("Player::run called twice");
		let mut host_rx = self.host_rx.take().expect("Player::run called twice");

		let control = SourceControl { buffer_state: self.buffer_state_rx.clone(), stall: stall_rx, commands: command_rx, cancel: self.cancel.clone() };

		let mut timeout_kind = TimeoutKind::Start;
		let mut timeout_deadline = Some(Instant::now() + self.idle_timeout);

		let (events_tx, mut events_rx) = mpsc::unbounded_channel();
		let mut bridge = Bridge { tx: events_tx };
		let open_fut = source.open(url, params, true, &mut bridge, control);
		tokio::pin!(open_fut);

		let result = loop {
			tokio::select! {
				biased;
				result = &mut open_fut => break result,
				_ = sleep_until_or_pending(timeout_deadline) => {
					warn!(?timeout_kind, "player timeout elapsed");
					self.cancel.cancel();
					let _ = (&mut open_fut).await;
					break Err(timeout_kind.into_error().into());
				}
				Some(event) = host_rx.recv() => {
					self.handle_host_event(event, sink, &mut timeout_kind, &mut timeout_deadline);
				}
				Some(callback) = events_rx.recv() => {
					self.handle_source_callback(callback, sink, &mut timeout_deadline);
				}
			}
		};

		self.on_close(sink, result.as_ref().err());
		result
	}

	fn handle_host_event(&mut self, event: HostEvent, sink: &mut dyn MediaSink, timeout_kind: &mut TimeoutKind, timeout_deadline: &mut Option<Instant>) {
		match event {
			HostEvent::MediaSourceOpen => {
				if *timeout_kind == TimeoutKind::Start {
					*timeout_kind = TimeoutKind::Connection;
					*timeout_deadline = Some(Instant::now() + self.idle_timeout);
				}
			}
			HostEvent::Waiting => {
				self.reevaluate(sink);
				if self.state != BufferState::None && self.playback.buffer_amount_ms(sink) <= self.thresholds.low as u64 {
					self.state = BufferState::Low;
					self.stalled = true;
					let _ = self.stall_tx.send(());
					*timeout_kind = TimeoutKind::Data;
					*timeout_deadline = Some(Instant::now() + self.idle_timeout);
					debug!("player stalled; forced LOW and started data timeout");
					self.observer.on_stall();
				}
			}
			HostEvent::CanPlay => {
				if self.stalled {
					self.stalled = false;
					*timeout_deadline = None;
					self.observer.on_resume();
				}
			}
			HostEvent::TimeUpdate => self.reevaluate(sink),
			HostEvent::Seek { requested_time } => {
				sink.set_current_time(requested_time);
				let amount = self.playback.buffer_amount_ms(sink);
				if !self.reliable && amount > self.thresholds.high as u64 {
					self.go_live(sink);
				}
				self.reevaluate(sink);
			}
		}
	}

	fn handle_source_callback(&mut self, callback: SourceCallback, sink: &mut dyn MediaSink, timeout_deadline: &mut Option<Instant>) {
		match callback {
			SourceCallback::Metadata(metadata) => {
				self.observer.on_metadata(&metadata);
				self.metadata = Some(metadata);
			}
			SourceCallback::TrackChange { video_track_id, audio_track_id } => {
				debug!(?video_track_id, ?audio_track_id, "effective track change");
			}
			SourceCallback::Sample { kind, track_id, sample } => {
				*timeout_deadline = None;

				if let Err(err) = self.ensure_initialized(kind, track_id, sink) {
					warn!(?err, "failed to initialize track");
					return;
				}

				match self.playback.write_sample(kind, &sample, sink) {
					Ok(()) => {}
					Err(err) if err.is_recoverable() => {
						sink.set_current_time(sink.current_time() + 10.0);
					}
					Err(err) => warn!(?err, "dropping sample after unrecoverable append error"),
				}

				self.reevaluate(sink);
			}
			SourceCallback::Data { track_id, time, payload } => {
				self.observer.on_data(track_id, time, payload);
			}
			SourceCallback::AudioSkipping(delta_ms) => self.observer.on_audio_skipping(delta_ms),
			SourceCallback::VideoSkipping(delta_ms) => self.observer.on_video_skipping(delta_ms),
		}
	}

	/// Re-derive `bufferAmount`, advance the state machine, apply the
	/// dynamic rate on a transition, and enforce the "`currentTime` must
	/// never fall behind `startTime`" invariant (§4.7).
	fn reevaluate(&mut self, sink: &mut dyn MediaSink) {
		let amount = self.playback.buffer_amount_ms(sink);
		let previous = self.state;
		let next = next_state(previous, amount, self.thresholds);

		if next != previous {
			self.state = next;
			self.playback.apply_dynamic_rate(next, sink);
			self.observer.on_state(next);

			if previous == BufferState::None {
				self.buffering = false;
				let end_time = self.playback.end_time(sink);
				if !self.reliable && (end_time - sink.current_time()) * 1000.0 > self.thresholds.high as f64 {
					self.go_live(sink);
				}
			}
			self.publish_buffer_state();
		}

		if sink.current_time() < sink.start_time() {
			self.go_live(sink);
		}
	}

	fn go_live(&mut self, sink: &mut dyn MediaSink) {
		self.playback.go_live(self.thresholds.middle(), sink);
		self.observer.on_go_live();
	}

	fn publish_buffer_state(&self) {
		let _ = self.buffer_state_tx.send(PlaybackStatus { state: self.state, buffering: self.buffering });
	}

	/// Close sequence (§5): the Source has already returned by the time
	/// `run` reaches here; this drops `Playback`'s writers, releases the
	/// sink and fires `onStop` exactly once.
	fn on_close(&mut self, _sink: &mut dyn MediaSink, err: Option<&Error>) {
		info!(final_state = ?self.state, has_error = err.is_some(), "player session closed");
		self.observer.on_stop(err);
	}

	fn track_info_for(track: &Track) -> Result<TrackInfo> {
		Ok(TrackInfo {
			codec: codec_from_str(&track.codec)?,
			config: track.config.clone().unwrap_or_default(),
			resolution: track.resolution.map(|r| wrts_mux::Resolution { width: r.width, height: r.height }),
			channels: track.channels,
			sample_rate: track.rate.map(|hz| hz.round() as u32),
		})
	}

	fn protection_for(metadata: &Metadata, track: &Track) -> Option<MuxProtection> {
		let key = track.content_protection.as_ref()?;
		let entry: &ProtectionEntry = metadata.content_protection.get(key)?;
		Some(mux_protection(entry))
	}

	/// Bind a newly-seen track's decoder config (and content protection, if
	/// any) before the first sample of its kind is written. Idempotent:
	/// [`crate::media_buffer::MediaBuffer::initialize`] no-ops past the
	/// first call.
	fn ensure_initialized(&mut self, kind: TrackKind, track_id: u32, sink: &mut dyn MediaSink) -> Result<()> {
		let metadata = self.metadata.as_ref().ok_or(MediaBufferError::TrackWithoutMetadata)?;
		let track = metadata.track(track_id).ok_or(MediaBufferError::TrackWithoutMetadata)?;
		let info = Self::track_info_for(track)?;
		let protection = Self::protection_for(metadata, track);
		self.playback.initialize_track(kind, info, protection, sink)?;
		Ok(())
	}
}

fn mux_protection(entry: &ProtectionEntry) -> MuxProtection {
	MuxProtection { scheme: entry.scheme, key_id: entry.key_id, iv: entry.iv, pssh: entry.pssh.iter().map(|p| MuxPssh { bytes: p.data.clone() }).collect() }
}

/// Map a manifest codec string (`avc1.*`, `hvc1.*`/`hev1.*`, `mp4a.*`, or a
/// bare `h264`/`h265`/`aac`/`mp3`) to the writer's [`Codec`]. `mp4a.6b` is
/// MPEG-1 Layer 3 carried in an MP4 sample entry, so it maps to
/// [`Codec::Mp3`] rather than [`Codec::Aac`].
fn codec_from_str(codec: &str) -> Result<Codec> {
	let lower = codec.to_ascii_lowercase();
	if lower.starts_with("mp4a.6b") || lower.starts_with("mp3") {
		Ok(Codec::Mp3)
	} else if lower.starts_with("avc1") || lower.starts_with("h264") {
		Ok(Codec::H264)
	} else if lower.starts_with("hvc1") || lower.starts_with("hev1") || lower.starts_with("h265") {
		Ok(Codec::H265)
	} else if lower.starts_with("mp4a") || lower.starts_with("aac") {
		Ok(Codec::Aac)
	} else {
		Err(wrts_mux::Error::UnsupportedCodec(codec.to_string()).into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use std::collections::HashMap;

	#[test]
	fn codec_from_str_recognizes_common_fourccs() {
		assert!(matches!(codec_from_str("avc1.64001f").unwrap(), Codec::H264));
		assert!(matches!(codec_from_str("hvc1.1.6.L93.B0").unwrap(), Codec::H265));
		assert!(matches!(codec_from_str("mp4a.40.2").unwrap(), Codec::Aac));
		assert!(matches!(codec_from_str("mp4a.6b").unwrap(), Codec::Mp3));
		assert!(codec_from_str("opus").is_err());
	}

	#[test]
	fn new_player_starts_in_none_with_default_thresholds() {
		let player = Player::new(Environment::new());
		assert_eq!(player.state(), BufferState::None);
		assert_eq!(player.thresholds.low, 150);
		assert_eq!(player.thresholds.high, 550);
	}

	#[test]
	fn handle_sends_reach_their_channels_without_panicking() {
		let player = Player::new(Environment::new());
		let handle = player.handle();
		handle.set_reliable(false);
		handle.set_track(TrackKind::Audio, Some(TrackSelection::Disabled));
		handle.waiting();
		handle.seek(12.5);
		handle.stop();
		assert!(player.cancel.is_cancelled());
	}

	#[derive(Default)]
	struct FakeSink {
		end: HashMap<TrackKind, f64>,
		current: f64,
		start: f64,
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
		fn set_playback_rate(&mut self, _rate: f64) {}
	}

	#[test]
	fn reevaluate_leaves_none_and_applies_go_live_once_unreliable_and_far_behind() {
		let mut player = Player::new(Environment::new()).with_reliable(false);
		let mut sink = FakeSink { end: [(TrackKind::Audio, 5.0), (TrackKind::Video, 5.0)].into_iter().collect(), ..Default::default() };
		let track = TrackInfo { codec: Codec::Aac, config: Bytes::new(), resolution: None, channels: Some(2), sample_rate: Some(48_000) };
		player.playback.initialize_track(TrackKind::Audio, track.clone(), None, &mut sink).unwrap();
		player.playback.initialize_track(TrackKind::Video, track, None, &mut sink).unwrap();

		player.reevaluate(&mut sink);
		assert_ne!(player.state(), BufferState::None);
		// goLive should have pulled current_time close to the live edge.
		assert!(sink.current > 0.0);
	}

	#[test]
	fn reevaluate_corrects_current_time_behind_start_time() {
		let mut player = Player::new(Environment::new());
		let mut sink = FakeSink { start: 10.0, current: 2.0, ..Default::default() };
		player.reevaluate(&mut sink);
		assert!(sink.current >= 10.0);
	}
}
