//! Pull-based adaptive controller: fetches numbered audio/video sequences
//! over HTTP, adapts bitrate, and skips sequences/frames to hold the live
//! edge under congestion (§4.5).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;
use url::Url;
use wrts_demux::{Event as DemuxEvent, TrackKind};

use crate::adaptive_retry::AdaptiveRetry;
use crate::buffer_state::{BufferState, PlaybackStatus};
use crate::cancel::{CancelToken, Outcome};
use crate::cmcd::{Cmcd, ObjectType};
use crate::error::{Error, ReaderError, Result, SourceError};
use crate::metadata::{Metadata, ProtectionEntry, Pssh};
use crate::track::{Resolution, Track};

use super::rendition::{frame_skip_candidate, select_rendition, stretch_to_sequence_duration, up_probe_range_len};
use super::selection::TrackSelection;
use super::{OpenParams, Source, SourceBase, SourceControl, SourceEvents};

const MANIFEST_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// `sequence.pattern` placeholders, substituted per §6.
fn build_sequence_url(base: &Url, pattern: &str, track_id: u32, sequence_id: u64, ext: &str) -> Result<Url> {
	let path = pattern
		.replace("{trackId}", &track_id.to_string())
		.replace("{sequenceId}", &sequence_id.to_string())
		.replace("{ext}", ext);
	base.join(&path).map_err(Error::from)
}

/// `<endpoint>` normalized to end with `.json`, per §4.5 startup step 1.
fn manifest_url(endpoint: &Url) -> Result<Url> {
	if endpoint.path().ends_with(".json") {
		return Ok(endpoint.clone());
	}
	let mut url = endpoint.clone();
	let mut segments: Vec<String> = url.path_segments().map(|s| s.map(str::to_string).collect()).unwrap_or_default();
	if let Some(last) = segments.last_mut() {
		*last = "index.json".to_string();
	} else {
		segments.push("index.json".to_string());
	}
	url.set_path(&segments.join("/"));
	Ok(url)
}

#[derive(Debug, Deserialize)]
struct ManifestResolution {
	width: u16,
	height: u16,
}

#[derive(Debug, Deserialize)]
struct ManifestTrack {
	id: u32,
	#[serde(rename = "type")]
	kind: String,
	codec: Option<String>,
	#[serde(rename = "codecDescription")]
	codec_description: Option<String>,
	bandwidth: u64,
	#[serde(rename = "sampleRate")]
	sample_rate: Option<f64>,
	#[serde(rename = "frameRate")]
	frame_rate: Option<f64>,
	channels: Option<u16>,
	resolution: Option<ManifestResolution>,
	config: Option<String>,
	#[serde(rename = "contentProtection")]
	content_protection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestSequence {
	pattern: String,
	#[serde(rename = "currentId")]
	current_id: u64,
}

#[derive(Debug, Deserialize)]
struct ManifestProtectionEntry {
	scheme: String,
	kid: String,
	iv: Option<String>,
	#[serde(default)]
	pssh: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
	#[serde(flatten)]
	raw: serde_json::Value,
	tracks: Vec<ManifestTrack>,
	sequence: ManifestSequence,
	#[serde(default, rename = "contentProtection")]
	content_protection: Vec<ManifestProtectionEntry>,
}

/// `liveTime`/`currentTime` may be given in milliseconds or seconds; the
/// unit is inferred by whether the JSON number carries a decimal point.
fn parse_live_time_ms(raw: &serde_json::Value) -> Option<u64> {
	let value = raw.get("liveTime").or_else(|| raw.get("currentTime"))?;
	let as_seconds = value.to_string().contains('.');
	let number = value.as_f64()?;
	Some(if as_seconds { (number * 1000.0).round() as u64 } else { number as u64 })
}

fn parse_manifest(body: &[u8]) -> Result<(Metadata, ManifestSequence)> {
	let manifest: Manifest = serde_json::from_slice(body)?;
	let live_time_ms = parse_live_time_ms(&manifest.raw).unwrap_or(0);

	let mut content_protection = HashMap::new();
	for entry in &manifest.content_protection {
		let scheme = wrts_mux::Scheme::parse(&entry.scheme).map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
		let mut key_id = [0u8; 16];
		hex::decode_to_slice(&entry.kid, &mut key_id).map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
		let iv = match &entry.iv {
			Some(hex_iv) => {
				let mut iv = [0u8; 16];
				hex::decode_to_slice(hex_iv, &mut iv).map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
				Some(iv)
			}
			None => None,
		};
		let pssh = entry
			.pssh
			.iter()
			.map(|(drm_system_id, b64)| {
				use base64::Engine;
				base64::engine::general_purpose::STANDARD.decode(b64).map(|data| Pssh { drm_system_id: drm_system_id.clone(), data: Bytes::from(data) })
			})
			.collect::<std::result::Result<Vec<_>, _>>()
			.map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
		content_protection.insert(entry.kid.clone(), ProtectionEntry { scheme, key_id, iv, pssh });
	}

	let mut tracks = Vec::with_capacity(manifest.tracks.len());
	for mt in manifest.tracks {
		let kind = match mt.kind.as_str() {
			"audio" => TrackKind::Audio,
			"video" => TrackKind::Video,
			"data" => TrackKind::Data,
			other => return Err(SourceError::MalformedPayload(format!("unknown track type {other}")).into()),
		};
		let mut track = Track::new(mt.id, kind, mt.codec.clone().unwrap_or_default(), mt.bandwidth);
		track.codec_string = mt.codec_description.or(mt.codec);
		track.rate = mt.sample_rate.or(mt.frame_rate);
		track.channels = mt.channels;
		track.resolution = mt.resolution.map(|r| Resolution { width: r.width, height: r.height });
		track.content_protection = mt.content_protection;
		if let Some(config) = mt.config {
			use base64::Engine;
			let decoded = base64::engine::general_purpose::STANDARD.decode(config).map_err(|e| SourceError::MalformedPayload(e.to_string()))?;
			track.config = Some(Bytes::from(decoded));
		}
		tracks.push(track);
	}

	Ok((Metadata::fix(live_time_ms, tracks, content_protection), manifest.sequence))
}

/// Per-request byte-rate measurement averaged over a bounded window
/// (§GLOSSARY "recvByteRate").
#[derive(Debug, Default)]
struct RateMeter {
	window: VecDeque<(Instant, u64)>,
}

const RATE_WINDOW: Duration = Duration::from_secs(10);

impl RateMeter {
	fn record(&mut self, bytes: u64) {
		let now = Instant::now();
		self.window.push_back((now, bytes));
		while let Some(&(t, _)) = self.window.front() {
			if now.duration_since(t) > RATE_WINDOW {
				self.window.pop_front();
			} else {
				break;
			}
		}
	}

	fn bytes_per_sec(&self) -> u64 {
		if self.window.len() < 2 {
			return 0;
		}
		let total: u64 = self.window.iter().map(|&(_, b)| b).sum();
		let span = self.window.back().unwrap().0.duration_since(self.window.front().unwrap().0).as_secs_f64();
		if span <= 0.0 {
			0
		} else {
			(total as f64 / span) as u64
		}
	}
}

/// The three independently cancellable in-flight request slots named in §5
/// ("audio", "video", "up" — the manifest retry loop backs off on its own and
/// needs no token).
#[derive(Default)]
struct Tokens {
	audio: CancelToken,
	video: CancelToken,
	up: CancelToken,
}

impl Tokens {
	fn reset(&self) {
		self.audio.reset();
		self.video.reset();
		self.up.reset();
	}

	fn abort_playback(&self) {
		self.audio.cancel();
		self.video.cancel();
		self.up.cancel();
	}

	fn abort_up(&self) {
		self.up.cancel();
	}
}

/// Whether Common Media Client Data rides along as a query parameter or as
/// request headers (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmcdMode {
	#[default]
	Query,
	Headers,
	Disabled,
}

fn track_selection_query(id: Option<u32>) -> String {
	match id {
		Some(id) => format!("{id}~"),
		None => "~".to_string(),
	}
}

fn parse_max_sequence_duration(resp: &Response) -> Option<u64> {
	resp.headers().get("max-sequence-duration").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

/// Plain GET of one sequence body, optionally range-restricted. No `self`
/// crosses this function's `.await` points, so it can run concurrently with
/// its siblings inside [`HttpAdaptiveSource::run_sequence`]'s `tokio::join!`.
async fn fetch_get(client: Client, url: Url, query: Vec<(String, String)>, cmcd_header: Option<String>, range: Option<(u64, u64)>) -> Result<(Bytes, Option<u64>)> {
	let mut req = client.get(url).query(&query);
	if let Some(value) = cmcd_header {
		req = req.header("CMCD-Object", value);
	}
	if let Some((start, end)) = range {
		req = req.header("Range", format!("bytes={start}-{end}"));
	}
	let resp = req.send().await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
	let max_sequence_duration_ms = parse_max_sequence_duration(&resp);
	if !resp.status().is_success() {
		return Err(SourceError::from_request_detail(resp.status().to_string()).into());
	}
	let body = resp.bytes().await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
	Ok((body, max_sequence_duration_ms))
}

/// Last-chance rendition (§4.5): HEAD for `first-frame-length`, then GET only
/// that many bytes so a single key frame keeps audio continuous while the
/// bottom rendition is still too heavy to fetch in full.
async fn fetch_last_chance(client: Client, url: Url, query: Vec<(String, String)>, cmcd_header: Option<String>) -> Result<(Bytes, Option<u64>)> {
	let head = client.head(url.clone()).send().await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
	let head_duration = parse_max_sequence_duration(&head);
	let first_frame_length: u64 = head
		.headers()
		.get("first-frame-length")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok())
		.ok_or_else(|| SourceError::UnexpectedIssue("last-chance rendition requires first-frame-length".into()))?;

	let (body, get_duration) = fetch_get(client, url, query, cmcd_header, Some((0, first_frame_length.saturating_sub(1)))).await?;
	Ok((body, get_duration.or(head_duration)))
}

/// Bandwidth-emulation "up" probe: fetch a byte range of the previous
/// sequence on the higher rendition and discard it. Only its
/// completion/cancellation is ever observed by the caller.
async fn fetch_up_probe(client: Client, url: Url, byte_len: u64) -> Result<()> {
	let resp = client
		.get(url)
		.header("Range", format!("bytes=0-{}", byte_len.saturating_sub(1)))
		.send()
		.await
		.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
	let _ = resp.bytes().await;
	Ok(())
}

pub struct HttpAdaptiveSource {
	base: SourceBase,
	client: Client,
	adaptive_retry: AdaptiveRetry,
	tokens: Tokens,
	manifest_base: Option<Url>,
	sequence: Option<ManifestSequence>,
	next_sequence_id: u64,
	audio_rate: RateMeter,
	video_rate: RateMeter,
	max_sequence_duration_ms: Option<u64>,
	prev_skip_candidate: Option<u64>,
	max_resolution: Option<Resolution>,
	selected_video: Option<u32>,
	selected_audio: Option<u32>,
	/// Set only by an explicit `TrackSelection::Track(id)`; while set,
	/// rendition selection (§4.5) is skipped entirely and the video track
	/// stays pinned to this id regardless of buffer state.
	pinned_video: Option<u32>,
	cmcd_session_id: String,
	cmcd_mode: CmcdMode,
	preload_ms: Option<u32>,
	first_request_sent: bool,
	buffer_starvation: bool,
	last_video_time: Option<u64>,
}

impl HttpAdaptiveSource {
	pub fn new(client: Client, cmcd_session_id: impl Into<String>) -> Self {
		Self {
			base: SourceBase::new(wrts_demux::RtsDemux::sized()),
			client,
			adaptive_retry: AdaptiveRetry::new(),
			tokens: Tokens::default(),
			manifest_base: None,
			sequence: None,
			next_sequence_id: 0,
			audio_rate: RateMeter::default(),
			video_rate: RateMeter::default(),
			max_sequence_duration_ms: None,
			prev_skip_candidate: None,
			max_resolution: None,
			selected_video: None,
			selected_audio: None,
			pinned_video: None,
			cmcd_session_id: cmcd_session_id.into(),
			cmcd_mode: CmcdMode::default(),
			preload_ms: None,
			first_request_sent: false,
			buffer_starvation: false,
			last_video_time: None,
		}
	}

	pub fn set_max_resolution(&mut self, resolution: Option<Resolution>) {
		self.max_resolution = resolution;
	}

	pub fn set_cmcd_mode(&mut self, mode: CmcdMode) {
		self.cmcd_mode = mode;
	}

	async fn fetch_manifest(&mut self, endpoint: &Url) -> Result<()> {
		let url = manifest_url(endpoint)?;
		loop {
			let started = Instant::now();
			match self.client.get(url.clone()).send().await {
				Ok(resp) if resp.status().is_success() => {
					let rtt = started.elapsed();
					let body = resp.bytes().await?;
					let (mut metadata, sequence) = parse_manifest(&body)?;
					metadata.live_time.adjust(rtt.as_millis() as i64 / 2);
					self.next_sequence_id = sequence.current_id;
					self.sequence = Some(sequence);
					self.base.metadata = Some(metadata);
					return Ok(());
				}
				Ok(resp) => warn!(status = %resp.status(), "manifest fetch failed, retrying"),
				Err(err) => warn!(error = %err, "manifest fetch transport error, retrying"),
			}
			sleep(MANIFEST_RETRY_BACKOFF).await;
		}
	}

	fn pick_video_track<'a>(&self, metadata: &'a Metadata) -> Option<&'a Track> {
		match self.selected_video {
			Some(id) => metadata.track(id),
			None => metadata.video_tracks().next(),
		}
	}

	fn under_max_resolution(&self, track: &Track) -> bool {
		match (track.resolution, self.max_resolution) {
			(Some(res), Some(max)) => res.width <= max.width && res.height <= max.height,
			_ => true,
		}
	}

	/// Sent only on the request immediately following `open`/a reconnect.
	fn take_preload_param(&mut self) -> Option<u32> {
		if self.first_request_sent {
			return None;
		}
		self.first_request_sent = true;
		self.preload_ms
	}

	fn build_query(&self, preload: Option<u32>) -> Vec<(String, String)> {
		let mut query = vec![
			("audio".to_string(), track_selection_query(self.selected_audio)),
			("video".to_string(), track_selection_query(self.selected_video)),
			("reliable".to_string(), self.base.reliable.to_string()),
		];
		if let Some(preload) = preload {
			query.push(("preload".to_string(), preload.to_string()));
		}
		query
	}

	fn build_cmcd(&self, object: ObjectType) -> Cmcd {
		let mut cmcd = Cmcd::new(self.cmcd_session_id.clone());
		cmcd.object_type = Some(object);
		cmcd.buffer_starvation = self.buffer_starvation;
		cmcd
	}

	/// Split `cmcd` into the query-param addition and/or header value implied
	/// by [`Self::cmcd_mode`] (§6).
	fn place_cmcd(&self, mut query: Vec<(String, String)>, cmcd: &Cmcd) -> (Vec<(String, String)>, Option<String>) {
		match self.cmcd_mode {
			CmcdMode::Query => {
				query.push(("cmcd".to_string(), cmcd.to_query_value()));
				(query, None)
			}
			CmcdMode::Headers => (query, Some(cmcd.to_header_value())),
			CmcdMode::Disabled => (query, None),
		}
	}

	fn record_rate(&mut self, kind: TrackKind, bytes: u64) {
		match kind {
			TrackKind::Audio => self.audio_rate.record(bytes),
			TrackKind::Video => self.video_rate.record(bytes),
			TrackKind::Data => {}
		}
	}

	fn recv_byte_rate(&self) -> u64 {
		self.audio_rate.bytes_per_sec() + self.video_rate.bytes_per_sec()
	}

	fn feed(&mut self, body: &[u8]) -> Result<Vec<DemuxEvent>> {
		let mut buf = BytesMut::from(body);
		self.base.demux.feed_bytes(&mut buf).map_err(ReaderError::InvalidPayload).map_err(Error::from)
	}

	fn apply_events(&mut self, events: Vec<DemuxEvent>, on_events: &mut dyn SourceEvents) {
		for event in events {
			match event {
				DemuxEvent::Media { kind, track_id, sample } => self.base.ingest_sample(kind, track_id, sample, on_events),
				DemuxEvent::Data { track_id, time, payload } => on_events.on_data(track_id, time, payload),
				DemuxEvent::TrackChange { video_track_id, audio_track_id } => {
					self.base.apply_track_change(video_track_id, audio_track_id, on_events);
					on_events.on_track_change(video_track_id, audio_track_id);
				}
				DemuxEvent::Metadata(_) => {}
			}
		}
	}

	/// A last-chance fetch only ever yields one usable video sample: whatever
	/// key frame fit in `first-frame-length`. Its duration is stretched to
	/// cover the whole sequence window (§4.5, §8 scenario #4).
	fn apply_last_chance_video(&mut self, body: &[u8], on_events: &mut dyn SourceEvents) -> Result<()> {
		let events = self.feed(body)?;
		let max_sequence_duration_ms = self.max_sequence_duration_ms;
		let mut delivered = false;
		for event in events {
			if delivered {
				break;
			}
			if let DemuxEvent::Media { kind, track_id, mut sample } = event {
				if let Some(duration) = max_sequence_duration_ms {
					let stretch = stretch_to_sequence_duration(&mut sample.duration, duration);
					if stretch > 0 {
						on_events.on_video_skipping(stretch);
					}
				}
				self.base.ingest_sample(kind, track_id, sample, on_events);
				delivered = true;
			}
		}
		Ok(())
	}

	/// One rendition-selection + fetch cycle for sequence `n`. Returns the
	/// sequence to fetch next and whether this round's video (or up) request
	/// was aborted, feeding the next iteration's rendition decision.
	async fn run_sequence(&mut self, n: u64, status: PlaybackStatus, recv_byte_rate: u64, aborted_or_stalled: bool, events: &mut dyn SourceEvents, control: &mut SourceControl) -> Result<(u64, bool)> {
		let sequence = self.sequence.clone().ok_or_else(|| SourceError::UnexpectedIssue("no manifest".into()))?;
		let base = self.manifest_base.clone().ok_or_else(|| SourceError::UnexpectedIssue("no manifest base".into()))?;
		let metadata = self.base.metadata.clone().ok_or_else(|| SourceError::UnexpectedIssue("no metadata".into()))?;

		let audio_bandwidth = metadata.audio_tracks().next().map(|t| t.bandwidth).unwrap_or(0);
		let up_probe_succeeded = self.adaptive_retry.try_now(Instant::now());

		let mut target_n = n;
		let mut chosen_video: Option<Track> = None;
		if let Some(video) = self.pick_video_track(&metadata) {
			// While the user has pinned a video track (§4.5 "user has not
			// pinned the track"), rendition selection never runs and the
			// chosen track stays exactly the pinned one.
			let chosen = if self.pinned_video.is_some() {
				video.clone()
			} else {
				let chosen = select_rendition(&metadata, video, audio_bandwidth, recv_byte_rate, aborted_or_stalled, up_probe_succeeded, status.state, self.max_resolution, &mut self.adaptive_retry).clone();
				self.selected_video = Some(chosen.id);
				chosen
			};

			if !self.base.reliable && status.buffering && status.state == BufferState::Low {
				let current_time = self.base.repair.current_time(TrackKind::Video).unwrap_or(0);
				loop {
					let live_time_ms = self.base.metadata.as_ref().map(|m| m.live_time.now_ms()).unwrap_or(0);
					let delay = live_time_ms as i64 - current_time as i64;
					let Some(candidate) = frame_skip_candidate(n, self.max_sequence_duration_ms, delay, self.prev_skip_candidate) else {
						break;
					};
					let head_url = build_sequence_url(&base, &sequence.pattern, chosen.id, candidate, "rts")?;
					match self.client.head(head_url).send().await {
						Ok(resp) if resp.status().is_success() => {
							target_n = candidate;
							break;
						}
						_ => {
							self.prev_skip_candidate = Some(candidate);
							let Some(duration) = self.max_sequence_duration_ms else {
								break;
							};
							let Some(real_metadata) = &mut self.base.metadata else {
								break;
							};
							real_metadata.live_time.adjust(-(duration as i64));
						}
					}
				}
			}
			chosen_video = Some(chosen);
		}

		let video_id = self.selected_video;
		let audio_id = self.selected_audio.or_else(|| metadata.audio_tracks().next().map(|t| t.id));
		self.tokens.reset();

		let last_chance = !self.base.reliable && !status.buffering && status.state == BufferState::Low && chosen_video.as_ref().is_some_and(|v| metadata.down(v).is_none());
		let skip_audio = last_chance && audio_id.is_some() && audio_id == video_id;

		let up_track = chosen_video.as_ref().and_then(|v| metadata.up(v)).filter(|up| self.under_max_resolution(up)).cloned();
		let up_probe_allowed = up_track.is_some() && up_probe_succeeded && self.last_video_time.is_some();

		let preload = self.take_preload_param();
		let query_base = self.build_query(preload);
		let reliable = self.base.reliable;

		let (audio_query, audio_header) = self.place_cmcd(query_base.clone(), &self.build_cmcd(ObjectType::Audio));
		let (video_query, video_header) = self.place_cmcd(query_base.clone(), &self.build_cmcd(ObjectType::Video));

		let audio_url = match (audio_id, skip_audio) {
			(Some(id), false) => Some(build_sequence_url(&base, &sequence.pattern, id, target_n, "rts")?),
			_ => None,
		};
		let video_url = match video_id {
			Some(id) => Some(build_sequence_url(&base, &sequence.pattern, id, target_n, "rts")?),
			None => None,
		};
		let up_len = if up_probe_allowed {
			let up = up_track.as_ref().unwrap();
			let prev_video_time = self.last_video_time.unwrap();
			let video_time = self.base.repair.current_time(TrackKind::Video).unwrap_or(prev_video_time);
			let extra_byte_rate = up.bandwidth as i64 - chosen_video.as_ref().map(|v| v.bandwidth).unwrap_or(0) as i64;
			up_probe_range_len(extra_byte_rate, video_time.saturating_sub(prev_video_time))
		} else {
			None
		};
		let up_url = match (&up_track, up_len) {
			(Some(up), Some(_)) => Some(build_sequence_url(&base, &sequence.pattern, up.id, target_n.saturating_sub(1), "rts")?),
			_ => None,
		};

		let audio_client = self.client.clone();
		let video_client = self.client.clone();
		let up_client = self.client.clone();
		let audio_token = self.tokens.audio.clone();
		let video_token = self.tokens.video.clone();
		let up_token = self.tokens.up.clone();

		// Fan out audio, video (or the last-chance ranged fetch) and the "up"
		// probe concurrently, each racing its own cancellation token so an
		// `onStall`/`onBufferState(LOW)` reaction observed mid-flight can
		// abort it (§5: "a state change to LOW is observable before any abort
		// it triggers issues"). None of these capture `self`, only owned
		// clones, so they can be safely joined while `self` stays untouched
		// until the round's results are applied below.
		let audio_fut = async move {
			match audio_url {
				Some(url) => Some(audio_token.race(fetch_get(audio_client, url, audio_query, audio_header, None)).await),
				None => None,
			}
		};
		let video_fut = async move {
			match video_url {
				Some(url) if last_chance => Some(video_token.race(fetch_last_chance(video_client, url, video_query, video_header)).await),
				Some(url) => Some(video_token.race(fetch_get(video_client, url, video_query, video_header, None)).await),
				None => None,
			}
		};
		let up_fut = async move {
			match (up_url, up_len) {
				(Some(url), Some(len)) => Some(up_token.race(fetch_up_probe(up_client, url, len)).await),
				_ => None,
			}
		};

		let fetch_all = async { tokio::join!(audio_fut, video_fut, up_fut) };
		tokio::pin!(fetch_all);

		let (audio_outcome, video_outcome, up_outcome) = loop {
			tokio::select! {
				biased;
				result = &mut fetch_all => break result,
				Some(()) = control.stall.recv() => {
					if !reliable {
						self.tokens.abort_playback();
					}
				}
				Ok(()) = control.buffer_state.changed() => {
					if control.buffer_state.borrow().state == BufferState::Low {
						self.tokens.abort_up();
					}
				}
			}
		};

		let mut aborted_this_round = false;

		match audio_outcome {
			Some(Outcome::Done(Ok((body, max_seq)))) => {
				if let Some(duration) = max_seq {
					self.max_sequence_duration_ms = Some(duration);
				}
				self.record_rate(TrackKind::Audio, body.len() as u64);
				self.buffer_starvation = false;
				let parsed = self.feed(&body)?;
				self.apply_events(parsed, events);
			}
			Some(Outcome::Done(Err(err))) => return Err(err),
			Some(Outcome::Aborted) => aborted_this_round = true,
			None => {}
		}

		match video_outcome {
			Some(Outcome::Done(Ok((body, max_seq)))) => {
				if let Some(duration) = max_seq {
					self.max_sequence_duration_ms = Some(duration);
				}
				self.record_rate(TrackKind::Video, body.len() as u64);
				self.buffer_starvation = false;
				if last_chance {
					self.apply_last_chance_video(&body, events)?;
				} else {
					let parsed = self.feed(&body)?;
					self.apply_events(parsed, events);
				}
				self.last_video_time = self.base.repair.current_time(TrackKind::Video).or(self.last_video_time);
			}
			Some(Outcome::Done(Err(err))) => return Err(err),
			Some(Outcome::Aborted) => aborted_this_round = true,
			None => {}
		}

		if let Some(Outcome::Aborted) = up_outcome {
			aborted_this_round = true;
		}

		Ok((target_n + 1, aborted_this_round))
	}
}

#[async_trait::async_trait(?Send)]
impl Source for HttpAdaptiveSource {
	async fn open(&mut self, url: Url, params: OpenParams, _playing: bool, events: &mut dyn SourceEvents, mut control: SourceControl) -> Result<()> {
		self.base.reliable = params.reliable;
		self.preload_ms = params.preload_ms;
		self.manifest_base = Some(url.clone());
		self.fetch_manifest(&url).await?;

		if let Some(metadata) = &self.base.metadata {
			events.on_metadata(metadata);
		}

		if let Some(audio) = params.audio {
			self.selected_audio = match audio {
				TrackSelection::Track(id) => Some(id),
				_ => None,
			};
		}
		if let Some(video) = params.video {
			self.selected_video = match video {
				TrackSelection::Track(id) => Some(id),
				_ => None,
			};
			self.pinned_video = self.selected_video;
		}

		let mut n = self.next_sequence_id;
		let mut status = PlaybackStatus::default();
		let mut aborted_or_stalled = false;

		loop {
			if control.cancel.is_cancelled() {
				return Ok(());
			}
			if control.buffer_state.has_changed().unwrap_or(false) {
				status = *control.buffer_state.borrow_and_update();
				if status.state == BufferState::Low {
					self.tokens.abort_up();
				}
			}
			while let Ok(command) = control.commands.try_recv() {
				match command {
					super::SourceCommand::SetTrack { kind, selection } => self.set_track(kind, selection),
					super::SourceCommand::SetReliable(reliable) => self.set_reliable(reliable),
				}
			}
			let mut stalled = false;
			while control.stall.try_recv().is_ok() {
				stalled = true;
			}
			if stalled {
				self.buffer_starvation = true;
				if !self.base.reliable {
					self.tokens.abort_playback();
				}
			}

			let recv_byte_rate = self.recv_byte_rate();
			let (next_n, round_aborted) = self.run_sequence(n, status, recv_byte_rate, aborted_or_stalled || stalled, events, &mut control).await?;

			aborted_or_stalled = round_aborted;
			n = next_n;
		}
	}

	fn set_track(&mut self, kind: TrackKind, selection: Option<TrackSelection>) {
		let selection = selection.unwrap_or(TrackSelection::Automatic);
		self.base.selection.request(kind, selection);
		let pinned = match selection {
			TrackSelection::Track(id) => Some(id),
			TrackSelection::Automatic | TrackSelection::Disabled => None,
		};
		match kind {
			TrackKind::Audio => self.selected_audio = pinned,
			TrackKind::Video => {
				self.selected_video = pinned;
				self.pinned_video = pinned;
			}
			TrackKind::Data => {}
		}
	}

	fn set_reliable(&mut self, reliable: bool) {
		self.base.reliable = reliable;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manifest_url_appends_index_json_for_bare_endpoints() {
		let endpoint = Url::parse("https://example.com/live/stream").unwrap();
		let url = manifest_url(&endpoint).unwrap();
		assert_eq!(url.path(), "/live/index.json");
	}

	#[test]
	fn manifest_url_is_left_alone_when_already_json() {
		let endpoint = Url::parse("https://example.com/live/manifest.json").unwrap();
		let url = manifest_url(&endpoint).unwrap();
		assert_eq!(url, endpoint);
	}

	#[test]
	fn sequence_url_substitutes_all_placeholders() {
		let base = Url::parse("https://example.com/s/").unwrap();
		let url = build_sequence_url(&base, "s/{trackId}/{sequenceId}.{ext}", 1, 100, "rts").unwrap();
		assert_eq!(url.as_str(), "https://example.com/s/s/1/100.rts");
	}

	#[test]
	fn live_time_unit_is_inferred_from_the_decimal_point() {
		let ms = serde_json::json!({"liveTime": 12345});
		assert_eq!(parse_live_time_ms(&ms), Some(12345));

		let seconds = serde_json::json!({"currentTime": 12.5});
		assert_eq!(parse_live_time_ms(&seconds), Some(12500));
	}

	#[test]
	fn track_selection_query_marks_automatic_switching() {
		assert_eq!(track_selection_query(Some(3)), "3~");
		assert_eq!(track_selection_query(None), "~");
	}
}
