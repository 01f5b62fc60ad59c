//! The two streaming Source variants (§2 item 6): [`WsSource`], a single
//! long-lived bidirectional WebSocket connection, and [`HttpDirectSource`],
//! a single long HTTP response. Neither adapts bitrate or skips
//! frames/sequences — that policy belongs to [`super::http_adaptive`] alone
//! — but both repair timestamps and buffer first samples through the same
//! [`super::SourceBase`].

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wrts_demux::{Event as DemuxEvent, RtsDemux};

use crate::error::{Error, ReaderError, Result, SourceError};

use super::selection::TrackSelection;
use super::{OpenParams, Source, SourceBase, SourceCommand, SourceControl, SourceEvents};

/// `audio=<id>~`/`video=<id>~` encoded as a WebSocket JSON string value:
/// `"<id>~"` pinned-with-autoswitch, `"~"` automatic, `""` deselected.
fn track_selection_ws_value(selection: TrackSelection) -> String {
	match selection {
		TrackSelection::Track(id) => format!("{id}~"),
		TrackSelection::Automatic => "~".to_string(),
		TrackSelection::Disabled => String::new(),
	}
}

fn connect_query_params(params: &OpenParams) -> Vec<(String, String)> {
	let mut query = vec![
		("audio".to_string(), track_selection_ws_value(params.audio.unwrap_or(TrackSelection::Automatic))),
		("video".to_string(), track_selection_ws_value(params.video.unwrap_or(TrackSelection::Automatic))),
		("reliable".to_string(), params.reliable.to_string()),
	];
	if let Some(preload) = params.preload_ms {
		query.push(("preload".to_string(), preload.to_string()));
	}
	query
}

fn apply_events(base: &mut SourceBase, events: Vec<DemuxEvent>, on_events: &mut dyn SourceEvents) {
	for event in events {
		match event {
			DemuxEvent::Media { kind, track_id, sample } => base.ingest_sample(kind, track_id, sample, on_events),
			DemuxEvent::Data { track_id, time, payload } => on_events.on_data(track_id, time, payload),
			DemuxEvent::TrackChange { video_track_id, audio_track_id } => {
				base.apply_track_change(video_track_id, audio_track_id, on_events);
				on_events.on_track_change(video_track_id, audio_track_id);
			}
			DemuxEvent::Metadata(_) => {}
		}
	}
}

/// One long-lived bidirectional WebSocket connection (§6 "WebSocket
/// variant"). The server pushes binary, framed RTS messages (no size
/// prefix, since each message already equals one packet); the client pushes
/// JSON control messages for track/reliability changes.
pub struct WsSource {
	base: SourceBase,
}

impl WsSource {
	pub fn new() -> Self {
		Self { base: SourceBase::new(RtsDemux::framed()) }
	}
}

impl Default for WsSource {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait(?Send)]
impl Source for WsSource {
	async fn open(&mut self, url: Url, params: OpenParams, _playing: bool, events: &mut dyn SourceEvents, mut control: SourceControl) -> Result<()> {
		self.base.reliable = params.reliable;

		let mut connect_url = url;
		connect_url.query_pairs_mut().extend_pairs(connect_query_params(&params));

		let (ws, _response) = tokio_tungstenite::connect_async(connect_url.as_str()).await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
		let (mut write, mut read) = ws.split();

		loop {
			if control.cancel.is_cancelled() {
				let _ = write.close().await;
				return Ok(());
			}

			tokio::select! {
				biased;
				_ = control.cancel.cancelled() => {
					let _ = write.close().await;
					return Ok(());
				}
				Some(command) = control.commands.recv() => {
					let json = match command {
						SourceCommand::SetTrack { kind, selection } => {
							self.set_track(kind, selection);
							let field = match kind {
								wrts_demux::TrackKind::Audio => "audio",
								wrts_demux::TrackKind::Video => "video",
								wrts_demux::TrackKind::Data => continue,
							};
							serde_json::json!({ field: track_selection_ws_value(selection.unwrap_or(TrackSelection::Automatic)) })
						}
						SourceCommand::SetReliable(reliable) => {
							self.set_reliable(reliable);
							serde_json::json!({ "reliable": reliable })
						}
					};
					write.send(Message::Text(json.to_string().into())).await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
				}
				message = read.next() => {
					match message {
						Some(Ok(Message::Binary(data))) => {
							let event = self.base.demux.feed_frame(&data).map_err(ReaderError::InvalidPayload)?;
							apply_events(&mut self.base, vec![event], events);
						}
						Some(Ok(Message::Close(_))) | None => return Ok(()),
						Some(Ok(_)) => {}
						Some(Err(err)) => return Err(SourceError::from_request_detail(err.to_string()).into()),
					}
				}
			}
		}
	}

	fn set_track(&mut self, kind: wrts_demux::TrackKind, selection: Option<TrackSelection>) {
		self.base.selection.request(kind, selection.unwrap_or(TrackSelection::Automatic));
	}

	fn set_reliable(&mut self, reliable: bool) {
		self.base.reliable = reliable;
	}
}

/// A single long HTTP response carrying a size-prefixed byte stream of RTS
/// packets (§4.1 mode (b)). Track/reliability changes can't be renegotiated
/// on an already-open response, so a command reopens the connection with
/// updated query parameters — the in-flight body read is cancelled and a
/// fresh GET is issued, picking the stream up from whatever sequencing the
/// server resumes it at.
pub struct HttpDirectSource {
	base: SourceBase,
	client: Client,
}

impl HttpDirectSource {
	pub fn new(client: Client) -> Self {
		Self { base: SourceBase::new(RtsDemux::sized()), client }
	}
}

#[async_trait::async_trait(?Send)]
impl Source for HttpDirectSource {
	async fn open(&mut self, url: Url, params: OpenParams, _playing: bool, events: &mut dyn SourceEvents, mut control: SourceControl) -> Result<()> {
		self.base.reliable = params.reliable;
		let mut audio = params.audio.unwrap_or(TrackSelection::Automatic);
		let mut video = params.video.unwrap_or(TrackSelection::Automatic);
		let mut preload = params.preload_ms;

		'reconnect: loop {
			if control.cancel.is_cancelled() {
				return Ok(());
			}

			let mut query = vec![
				("audio".to_string(), track_selection_ws_value(audio)),
				("video".to_string(), track_selection_ws_value(video)),
				("reliable".to_string(), self.base.reliable.to_string()),
			];
			if let Some(p) = preload.take() {
				query.push(("preload".to_string(), p.to_string()));
			}

			let resp = self.client.get(url.clone()).query(&query).send().await.map_err(|e| SourceError::from_request_detail(e.to_string()))?;
			if !resp.status().is_success() {
				return Err(SourceError::from_request_detail(resp.status().to_string()).into());
			}

			let mut stream = resp.bytes_stream();
			let mut buf = BytesMut::new();

			loop {
				if control.cancel.is_cancelled() {
					return Ok(());
				}

				tokio::select! {
					biased;
					_ = control.cancel.cancelled() => return Ok(()),
					Some(command) = control.commands.recv() => {
						match command {
							SourceCommand::SetTrack { kind, selection } => {
								let selection = selection.unwrap_or(TrackSelection::Automatic);
								match kind {
									wrts_demux::TrackKind::Audio => audio = selection,
									wrts_demux::TrackKind::Video => video = selection,
									wrts_demux::TrackKind::Data => {}
								}
							}
							SourceCommand::SetReliable(reliable) => self.base.reliable = reliable,
						}
						continue 'reconnect;
					}
					chunk = stream.next() => {
						match chunk {
							Some(Ok(bytes)) => {
								buf.extend_from_slice(&bytes);
								let parsed = self.base.demux.feed_bytes(&mut buf).map_err(ReaderError::InvalidPayload).map_err(Error::from)?;
								apply_events(&mut self.base, parsed, events);
							}
							Some(Err(err)) => return Err(SourceError::from_request_detail(err.to_string()).into()),
							None => return Ok(()),
						}
					}
				}
			}
		}
	}

	fn set_track(&mut self, kind: wrts_demux::TrackKind, selection: Option<TrackSelection>) {
		self.base.selection.request(kind, selection.unwrap_or(TrackSelection::Automatic));
	}

	fn set_reliable(&mut self, reliable: bool) {
		self.base.reliable = reliable;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ws_value_encodes_automatic_pinned_and_deselected() {
		assert_eq!(track_selection_ws_value(TrackSelection::Automatic), "~");
		assert_eq!(track_selection_ws_value(TrackSelection::Track(3)), "3~");
		assert_eq!(track_selection_ws_value(TrackSelection::Disabled), "");
	}
}
