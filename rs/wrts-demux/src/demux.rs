use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::leb128;
use crate::sample::{Sample, SubSample, TrackKind};

/// Something the demuxer produced while consuming bytes.
#[derive(Debug, Clone)]
pub enum Event {
	/// `Init Tracks`: (re)declares which track ids carry audio/video.
	/// A `None` mirrors the wire's `0` sentinel ("no track of this kind").
	TrackChange {
		video_track_id: Option<u32>,
		audio_track_id: Option<u32>,
	},

	/// A stream-level metadata packet, parsed JSON.
	Metadata(Value),

	/// An application data packet tied to a track's timeline.
	Data { track_id: u32, time: u64, payload: Value },

	/// A decoded audio or video sample.
	Media {
		kind: TrackKind,
		track_id: u32,
		sample: Sample,
	},
}

const TYPE_METADATA_OR_DATA: u8 = 0;
const TYPE_AUDIO: u8 = 1;
const TYPE_VIDEO: u8 = 2;
const TYPE_CONTROL: u8 = 3;

/// Parses the RTS wire container.
///
/// Construct with [`RtsDemux::framed`] when each input chunk is already one
/// complete packet (e.g. a WebSocket message), or [`RtsDemux::sized`] when
/// packets arrive back-to-back in a byte stream and must be delimited by
/// their own length prefixes.
pub struct RtsDemux {
	with_size: bool,
	next_time: HashMap<i64, u64>,
}

impl RtsDemux {
	pub fn framed() -> Self {
		Self {
			with_size: false,
			next_time: HashMap::new(),
		}
	}

	pub fn sized() -> Self {
		Self {
			with_size: true,
			next_time: HashMap::new(),
		}
	}

	pub fn with_size(&self) -> bool {
		self.with_size
	}

	/// Feed one complete frame (framed mode). The entire slice must decode
	/// to exactly one packet; anything else is a protocol error.
	pub fn feed_frame(&mut self, frame: &[u8]) -> Result<Event> {
		debug_assert!(!self.with_size, "feed_frame used on a sized demuxer");
		let mut cursor = frame;
		let hdr = *cursor.first().ok_or(Error::Truncated)?;
		cursor = &cursor[1..];

		let (packet_type, track_id) = split_header_byte(hdr);
		self.decode_body(packet_type, track_id, &mut cursor, None)
	}

	/// Feed more bytes of a size-prefixed byte stream, draining as many
	/// complete packets as are buffered. Returns the events produced, in
	/// order; any trailing incomplete packet remains buffered in `buf` for
	/// the next call (nothing is consumed for it).
	pub fn feed_bytes(&mut self, buf: &mut BytesMut) -> Result<Vec<Event>> {
		debug_assert!(self.with_size, "feed_bytes used on a framed demuxer");
		let mut events = Vec::new();

		loop {
			if buf.is_empty() {
				break;
			}
			let header_len = buf[0] as usize;
			if buf.len() < 1 + header_len {
				// Tolerated: wait for more bytes before parsing the header.
				break;
			}

			let mut header = &buf[1..1 + header_len];
			let hdr = *header.first().ok_or(Error::Truncated)?;
			header = &header[1..];
			let (packet_type, track_id) = split_header_byte(hdr);

			// Media packets carry their payload size inside the header
			// region; everything else is self-delimiting JSON that follows
			// the header verbatim.
			let is_media = matches!(packet_type, TYPE_AUDIO | TYPE_VIDEO);

			if is_media {
				// Parse just enough of the header to learn `size` without
				// mutating demuxer state, so we can check payload
				// availability before committing to consume anything.
				let mut probe = header;
				let needs_time = !self.next_time.contains_key(&track_id);
				if needs_time {
					leb128::get_u64_fatal(&mut probe)?;
				}
				let value = leb128::try_get_i64(&mut probe).ok_or(Error::Truncated)?;
				let has_composition_offset = (value >> 1) & 1 != 0;
				if has_composition_offset {
					leb128::get_u64_fatal(&mut probe)?;
				}
				let size = leb128::get_u64_fatal(&mut probe)? as usize;

				let payload_start = 1 + header_len;
				if buf.len() < payload_start + size {
					// Tolerated: header is known, payload isn't here yet.
					break;
				}

				let mut header_copy = header;
				let payload = Bytes::copy_from_slice(&buf[payload_start..payload_start + size]);
				let event = self.decode_body(packet_type, track_id, &mut header_copy, Some(payload))?;
				events.push(event);
				buf.advance(payload_start + size);
			} else {
				let mut header_copy = header;
				let event = self.decode_body(packet_type, track_id, &mut header_copy, None)?;
				events.push(event);
				buf.advance(1 + header_len);
			}
		}

		Ok(events)
	}

	/// Decode one packet's body. `explicit_payload` is `Some` only for
	/// size-prefixed media packets, where the payload was already sliced
	/// out by the caller; otherwise the payload is the remainder of `body`.
	fn decode_body(
		&mut self,
		packet_type: u8,
		track_id: i64,
		body: &mut &[u8],
		explicit_payload: Option<Bytes>,
	) -> Result<Event> {
		if track_id < 0 {
			return match packet_type {
				TYPE_CONTROL => {
					let video = leb128::get_u64_fatal(body)? as u32;
					let audio = leb128::get_u64_fatal(body)? as u32;
					// Clearing `next_time` forces the next media packet of
					// every track to carry an absolute `time` again.
					self.next_time.clear();
					Ok(Event::TrackChange {
						video_track_id: (video != 0).then(|| video - 1),
						audio_track_id: (audio != 0).then(|| audio - 1),
					})
				}
				TYPE_METADATA_OR_DATA => {
					let json = decode_json(body, explicit_payload)?;
					Ok(Event::Metadata(json))
				}
				other => Err(Error::InvalidPayload(other)),
			};
		}

		let track_id = track_id as u32;

		match packet_type {
			TYPE_METADATA_OR_DATA => {
				let time = leb128::get_u64_fatal(body)?;
				let payload = decode_json(body, explicit_payload)?;
				Ok(Event::Data { track_id, time, payload })
			}
			TYPE_AUDIO | TYPE_VIDEO => {
				let kind = if packet_type == TYPE_AUDIO {
					TrackKind::Audio
				} else {
					TrackKind::Video
				};

				let key = track_id as i64;
				let time = match self.next_time.get(&key) {
					Some(&t) => t,
					None => leb128::get_u64_fatal(body)?,
				};

				let value = leb128::get_u64_fatal(body)? as i64;
				let duration = value >> 2;
				let has_composition_offset = (value >> 1) & 1 != 0;
				let is_key_frame = value & 1 != 0;

				let composition_offset = if has_composition_offset {
					Some(leb128::get_u64_fatal(body)? as i32)
				} else {
					None
				};

				let data = match explicit_payload {
					Some(payload) => payload,
					None => {
						// Framed mode: whatever remains of the frame is the
						// payload (size is implicit).
						Bytes::copy_from_slice(body)
					}
				};

				self.next_time.insert(key, time.saturating_add(duration.max(0) as u64));

				let sample = Sample {
					time,
					duration,
					data,
					composition_offset,
					is_key_frame: Some(is_key_frame),
					sub_samples: None::<Vec<SubSample>>,
				};

				Ok(Event::Media { kind, track_id, sample })
			}
			other => {
				tracing::warn!(packet_type = other, track_id, "unknown media packet type");
				Err(Error::UnknownFormat(other, track_id as i64))
			}
		}
	}
}

fn split_header_byte(hdr: u8) -> (u8, i64) {
	let packet_type = hdr & 3;
	let track_id_plus1 = (hdr >> 2) as i64;
	(packet_type, track_id_plus1 - 1)
}

fn decode_json(body: &mut &[u8], explicit_payload: Option<Bytes>) -> Result<Value> {
	match explicit_payload {
		Some(payload) => Ok(serde_json::from_slice(&payload)?),
		None => Ok(serde_json::from_slice(body)?),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BufMut;

	fn header_byte(packet_type: u8, track_id: Option<u32>) -> u8 {
		let plus1 = track_id.map(|t| t + 1).unwrap_or(0);
		((plus1 as u8) << 2) | packet_type
	}

	#[test]
	fn init_tracks_then_media_without_time() {
		let mut demux = RtsDemux::framed();

		let mut init = BytesMut::new();
		init.put_u8(header_byte(TYPE_CONTROL, None));
		leb128::encode_u64(&mut init, 2); // video id 1
		leb128::encode_u64(&mut init, 1); // audio id 0

		match demux.feed_frame(&init).unwrap() {
			Event::TrackChange {
				video_track_id,
				audio_track_id,
			} => {
				assert_eq!(video_track_id, Some(1));
				assert_eq!(audio_track_id, Some(0));
			}
			other => panic!("unexpected event: {other:?}"),
		}

		let mut first = BytesMut::new();
		first.put_u8(header_byte(TYPE_VIDEO, Some(1)));
		leb128::encode_u64(&mut first, 5000); // absolute time
		let value = (40i64 << 2) | 1; // duration=40, no comp offset, keyframe
		leb128::encode_i64(&mut first, value);
		first.extend_from_slice(b"\xAB");

		match demux.feed_frame(&first).unwrap() {
			Event::Media { sample, .. } => {
				assert_eq!(sample.time, 5000);
				assert_eq!(sample.duration, 40);
				assert_eq!(sample.is_key_frame, Some(true));
			}
			other => panic!("unexpected event: {other:?}"),
		}

		let mut second = BytesMut::new();
		second.put_u8(header_byte(TYPE_VIDEO, Some(1)));
		let value = (40i64 << 2) | 1;
		leb128::encode_i64(&mut second, value); // no time: reuses next_time
		second.extend_from_slice(b"\xCD");

		match demux.feed_frame(&second).unwrap() {
			Event::Media { sample, .. } => {
				assert_eq!(sample.time, 5040);
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn sized_mode_tolerates_truncated_payload() {
		let mut demux = RtsDemux::sized();

		// Build one video media packet: header carries time + value + size.
		let mut header = BytesMut::new();
		header.put_u8(header_byte(TYPE_VIDEO, Some(0)));
		leb128::encode_u64(&mut header, 1000);
		leb128::encode_i64(&mut header, (20i64 << 2) | 1);
		leb128::encode_u64(&mut header, 4); // payload size

		let mut packet = BytesMut::new();
		packet.put_u8(header.len() as u8);
		packet.extend_from_slice(&header);
		packet.extend_from_slice(b"\x01\x02\x03\x04");

		// Feed everything except the last payload byte.
		let mut partial = BytesMut::new();
		partial.extend_from_slice(&packet[..packet.len() - 1]);
		let events = demux.feed_bytes(&mut partial).unwrap();
		assert!(events.is_empty());
		assert_eq!(partial.len(), packet.len() - 1, "nothing should be consumed yet");

		partial.extend_from_slice(&packet[packet.len() - 1..]);
		let events = demux.feed_bytes(&mut partial).unwrap();
		assert_eq!(events.len(), 1);
		assert!(partial.is_empty());
	}

	#[test]
	fn data_packet_carries_time_and_json() {
		let mut demux = RtsDemux::framed();
		let mut frame = BytesMut::new();
		frame.put_u8(header_byte(TYPE_METADATA_OR_DATA, Some(3)));
		leb128::encode_u64(&mut frame, 42);
		frame.extend_from_slice(br#"{"hello":"world"}"#);

		match demux.feed_frame(&frame).unwrap() {
			Event::Data { track_id, time, payload } => {
				assert_eq!(track_id, 3);
				assert_eq!(time, 42);
				assert_eq!(payload["hello"], "world");
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}
}
