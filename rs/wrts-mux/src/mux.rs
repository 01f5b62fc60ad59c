use bytes::{BufMut, Bytes, BytesMut};
use wrts_demux::Sample;

use crate::boxes::{put_full_header, write_box};
use crate::error::Result;
use crate::protection::{Protection, Scheme};
use crate::track::{Codec, TrackInfo};

const TIMESCALE: u32 = 1_000; // 1ms
const TRACK_ID: u32 = 1;

/// Writes fragmented ISO-BMFF (CMAF) for a single track: one initialization
/// segment (`ftyp`+`moov`), then one fragment (`moof`+`mdat`) per sample.
///
/// Box ordering and flag bits are fixed by the CMAF/ISO-BMFF spec; identical
/// inputs always produce byte-identical output.
pub struct CmafMux {
	track: TrackInfo,
	/// Next `mfhd` sequence number to use; starts at 1.
	next_sequence: u64,
}

impl CmafMux {
	pub fn new(track: TrackInfo) -> Self {
		Self { track, next_sequence: 1 }
	}

	/// Write the initialization segment: `ftyp` + `moov`.
	pub fn init(&self, protection: Option<&Protection>) -> Result<Bytes> {
		let mut buf = BytesMut::new();
		write_ftyp(&mut buf);
		self.write_moov(&mut buf, protection)?;
		Ok(buf.freeze())
	}

	/// Write one fragment: `moof` + `mdat` for a single sample.
	pub fn write(&mut self, sample: &Sample, protection: Option<&Protection>) -> Result<Bytes> {
		let sequence = self.next_sequence;
		self.next_sequence += 1;

		tracing::trace!(sequence, time = sample.time, duration = sample.duration, "write fragment");

		let mut buf = BytesMut::new();
		let moof_start = buf.len();

		let mut data_offset_pos = 0usize;
		write_box(&mut buf, b"moof", |buf| {
			write_box(buf, b"mfhd", |buf| {
				put_full_header(buf, 0, 0);
				buf.put_u32(sequence as u32);
			});

			write_box(buf, b"traf", |buf| {
				write_box(buf, b"tfhd", |buf| {
					// default-base-is-moof | sample-description-index-present
					let flags = 0x02_0000 | 0x00_0002;
					put_full_header(buf, 0, flags);
					buf.put_u32(TRACK_ID);
					buf.put_u32(1); // sample_description_index
				});

				write_box(buf, b"tfdt", |buf| {
					put_full_header(buf, 1, 0);
					buf.put_u64(sample.time);
				});

				write_box(buf, b"trun", |buf| {
					let flags = 0x00_0001 // data-offset-present
						| 0x00_0100 // sample-duration-present
						| 0x00_0200 // sample-size-present
						| 0x00_0400 // sample-flags-present
						| 0x00_0800; // sample-composition-time-offsets-present
					put_full_header(buf, 0, flags);
					buf.put_u32(1); // sample_count

					data_offset_pos = buf.len();
					buf.put_i32(0); // data_offset placeholder, patched below

					let is_video = self.track.is_video();
					let keyframe = sample.is_key_frame.unwrap_or(false);
					let sample_flags: u32 = if !is_video || keyframe { 0x0200_0000 } else { 0x0101_0000 };

					buf.put_u32(sample.duration.max(0) as u32);
					buf.put_u32(sample.data.len() as u32);
					buf.put_u32(sample_flags);
					buf.put_i32(sample.composition_offset.unwrap_or(0));
				});

				if let Some(protection) = protection {
					write_protection_traf(buf, sample, protection, self.track.is_audio());
				}
			});
		});

		let moof_len = buf.len() - moof_start;
		let data_offset = (moof_len + 8) as i32; // + mdat header
		buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

		write_box(&mut buf, b"mdat", |buf| {
			buf.put_slice(&sample.data);
		});

		Ok(buf.freeze())
	}

	fn write_moov(&self, buf: &mut BytesMut, protection: Option<&Protection>) -> Result<()> {
		write_box(buf, b"moov", |buf| {
			write_box(buf, b"mvhd", |buf| {
				put_full_header(buf, 0, 0);
				buf.put_u32(0); // creation_time
				buf.put_u32(0); // modification_time
				buf.put_u32(TIMESCALE);
				buf.put_u32(0); // duration
				buf.put_i32(0x0001_0000); // rate 1.0
				buf.put_i16(0x0100); // volume 1.0
				buf.put_u16(0); // reserved
				buf.put_u64(0); // reserved[2]
				for v in identity_matrix() {
					buf.put_i32(v);
				}
				for _ in 0..6 {
					buf.put_u32(0); // pre_defined
				}
				buf.put_u32(2); // next_track_ID
			});

			write_trak(buf, &self.track, protection);

			write_box(buf, b"mvex", |buf| {
				write_box(buf, b"trex", |buf| {
					put_full_header(buf, 0, 0);
					buf.put_u32(TRACK_ID);
					buf.put_u32(1); // default_sample_description_index
					buf.put_u32(0); // default_sample_duration
					buf.put_u32(0); // default_sample_size
					buf.put_u32(0); // default_sample_flags
				});
			});

			if let Some(protection) = protection {
				for pssh in &protection.pssh {
					buf.put_slice(&pssh.bytes);
				}
			}
		});

		Ok(())
	}
}

fn identity_matrix() -> [i32; 9] {
	[0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000]
}

fn write_ftyp(buf: &mut BytesMut) {
	write_box(buf, b"ftyp", |buf| {
		buf.put_slice(b"isom");
		buf.put_u32(0x200);
		for brand in [b"isom", b"cmfc", b"iso9", b"dash"] {
			buf.put_slice(brand);
		}
	});
}

fn write_trak(buf: &mut BytesMut, track: &TrackInfo, protection: Option<&Protection>) {
	write_box(buf, b"trak", |buf| {
		write_box(buf, b"tkhd", |buf| {
			put_full_header(buf, 0, 0x7); // enabled | in_movie | in_preview
			buf.put_u32(0); // creation_time
			buf.put_u32(0); // modification_time
			buf.put_u32(TRACK_ID);
			buf.put_u32(0); // reserved
			buf.put_u32(0); // duration
			buf.put_u64(0); // reserved[2]
			buf.put_i16(0); // layer
			buf.put_i16(0); // alternate_group
			buf.put_i16(if track.is_audio() { 0x0100 } else { 0 }); // volume
			buf.put_u16(0); // reserved
			for v in identity_matrix() {
				buf.put_i32(v);
			}
			let (width, height) = track
				.resolution
				.map(|r| (r.width, r.height))
				.unwrap_or((0, 0));
			buf.put_u32((width as u32) << 16);
			buf.put_u32((height as u32) << 16);
		});

		write_box(buf, b"mdia", |buf| {
			write_box(buf, b"mdhd", |buf| {
				put_full_header(buf, 0, 0);
				buf.put_u32(0); // creation_time
				buf.put_u32(0); // modification_time
				buf.put_u32(TIMESCALE);
				buf.put_u32(0); // duration
				buf.put_u16(0x55C4); // language = "und"
				buf.put_u16(0); // pre_defined
			});

			write_box(buf, b"hdlr", |buf| {
				put_full_header(buf, 0, 0);
				buf.put_u32(0); // pre_defined
				buf.put_slice(if track.is_video() { b"vide" } else { b"soun" });
				buf.put_u32(0);
				buf.put_u32(0);
				buf.put_u32(0); // reserved[3]
				buf.put_u8(0); // empty name, null-terminated
			});

			write_box(buf, b"minf", |buf| {
				if track.is_video() {
					write_box(buf, b"vmhd", |buf| {
						put_full_header(buf, 0, 1);
						buf.put_u16(0); // graphicsmode
						buf.put_u64(0); // opcolor
					});
				} else {
					write_box(buf, b"smhd", |buf| {
						put_full_header(buf, 0, 0);
						buf.put_i16(0); // balance
						buf.put_u16(0); // reserved
					});
				}

				write_box(buf, b"dinf", |buf| {
					write_box(buf, b"dref", |buf| {
						put_full_header(buf, 0, 0);
						buf.put_u32(1); // entry_count
						write_box(buf, b"url ", |buf| {
							put_full_header(buf, 0, 1); // self-contained
						});
					});
				});

				write_box(buf, b"stbl", |buf| {
					write_box(buf, b"stsd", |buf| {
						put_full_header(buf, 0, 0);
						buf.put_u32(1); // entry_count
						write_sample_entry(buf, track, protection);
					});
				});
			});
		});
	});
}

fn write_sample_entry(buf: &mut BytesMut, track: &TrackInfo, protection: Option<&Protection>) {
	let original_fourcc: [u8; 4] = match track.codec {
		Codec::H264 => *b"avc1",
		Codec::H265 => *b"hvc1",
		Codec::Aac => *b"mp4a",
		Codec::Mp3 => *b"mp4a",
	};

	let fourcc: [u8; 4] = match (protection, track.is_video()) {
		(Some(_), true) => *b"encv",
		(Some(_), false) => *b"enca",
		(None, _) => original_fourcc,
	};

	write_box(buf, &fourcc, |buf| {
		buf.put_bytes(0, 6); // reserved
		buf.put_u16(1); // data_reference_index

		if track.is_video() {
			let (width, height) = track.resolution.map(|r| (r.width, r.height)).unwrap_or((0, 0));
			buf.put_u16(0); // pre_defined
			buf.put_u16(0); // reserved
			buf.put_bytes(0, 12); // pre_defined[3]
			buf.put_u16(width);
			buf.put_u16(height);
			buf.put_u32(0x0048_0000); // horizresolution 72dpi
			buf.put_u32(0x0048_0000); // vertresolution 72dpi
			buf.put_u32(0); // reserved
			buf.put_u16(1); // frame_count
			buf.put_bytes(0, 32); // compressorname
			buf.put_u16(0x0018); // depth
			buf.put_i16(-1); // pre_defined = 0xFFFF, default color table

			match track.codec {
				Codec::H264 => write_box(buf, b"avcC", |buf| buf.put_slice(&track.config)),
				Codec::H265 => write_box(buf, b"hvcC", |buf| buf.put_slice(&track.config)),
				_ => {}
			}
		} else {
			buf.put_u32(0); // reserved[2] (version/revision/vendor)
			buf.put_u32(0);
			buf.put_u16(track.channels.unwrap_or(2));
			buf.put_u16(16); // sample size in bits
			buf.put_u16(0); // pre_defined
			buf.put_u16(0); // reserved
			buf.put_u32(track.sample_rate.unwrap_or(0) << 16);

			write_esds(buf, track);
		}

		if let Some(protection) = protection {
			write_sinf(buf, original_fourcc, protection, track.is_video());
		}
	});
}

fn write_esds(buf: &mut BytesMut, track: &TrackInfo) {
	let object_type_indication: u8 = match track.codec {
		Codec::Aac => 0x40,
		Codec::Mp3 => 0x69,
		_ => 0x40,
	};

	write_box(buf, b"esds", |buf| {
		put_full_header(buf, 0, 0);

		write_descriptor(buf, 0x03, |buf| {
			buf.put_u16(0); // ES_ID
			buf.put_u8(0); // flags

			write_descriptor(buf, 0x04, |buf| {
				buf.put_u8(object_type_indication);
				buf.put_u8(0x15); // stream_type=audio(5)<<2 | upstream=0 | reserved=1
				buf.put_uint(0, 3); // buffer_size_db
				buf.put_u32(0); // max_bitrate
				buf.put_u32(0); // avg_bitrate

				write_descriptor(buf, 0x05, |buf| {
					buf.put_slice(&track.config);
				});
			});

			write_descriptor(buf, 0x06, |buf| {
				buf.put_u8(0x02); // SL predefined
			});
		});
	});
}

/// MPEG-4 descriptors encode their length as 1-4 bytes, most-significant
/// byte first, continuation bit set on every byte but the last.
fn write_descriptor(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
	let mut tmp = BytesMut::new();
	body(&mut tmp);

	buf.put_u8(tag);
	let len = tmp.len();
	let mut bytes = [
		((len >> 21) & 0x7f) as u8,
		((len >> 14) & 0x7f) as u8,
		((len >> 7) & 0x7f) as u8,
		(len & 0x7f) as u8,
	];
	let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(3);
	for b in &mut bytes[first_nonzero..3] {
		*b |= 0x80;
	}
	buf.put_slice(&bytes[first_nonzero..]);
	buf.put_slice(&tmp);
}

fn write_sinf(buf: &mut BytesMut, original_format: [u8; 4], protection: &Protection, is_video: bool) {
	// CBCS pattern encryption (crypt_byte_block/skip_byte_block) only applies
	// to video; audio under CBCS is always full-sample encrypted.
	let cbcs_pattern = protection.scheme == Scheme::Cbcs && is_video;

	write_box(buf, b"sinf", |buf| {
		write_box(buf, b"frma", |buf| buf.put_slice(&original_format));

		write_box(buf, b"schm", |buf| {
			put_full_header(buf, 0, 0);
			buf.put_slice(&protection.scheme.fourcc());
			buf.put_u32(0x0001_0000); // scheme_version 1.0
		});

		write_box(buf, b"schi", |buf| {
			write_box(buf, b"tenc", |buf| {
				put_full_header(buf, if cbcs_pattern { 1 } else { 0 }, 0);
				buf.put_u8(0); // reserved
				if cbcs_pattern {
					buf.put_u8(Protection::CBCS_DEFAULT_CRYPT_BYTE_BLOCK << 4 | Protection::CBCS_DEFAULT_SKIP_BYTE_BLOCK);
				} else {
					buf.put_u8(0); // reserved
				}
				buf.put_u8(1); // default_is_protected
				buf.put_u8(protection.scheme.per_sample_iv_size());
				buf.put_slice(&protection.key_id);
				if protection.scheme == Scheme::Cbcs {
					let iv = protection.iv.unwrap_or([0u8; 16]);
					buf.put_u8(16); // default_constant_IV_size
					buf.put_slice(&iv);
				}
			});
		});
	});
}

fn write_protection_traf(buf: &mut BytesMut, sample: &Sample, protection: &Protection, is_audio: bool) {
	let has_subsamples = sample.sub_samples.is_some();
	let iv = if protection.scheme != Scheme::Cbcs {
		protection.iv
	} else {
		None
	};

	let sample_info_size = iv.map(|_| 16u8).unwrap_or(0)
		+ if has_subsamples {
			2 + sample.sub_samples.as_ref().unwrap().len() as u8 * 6
		} else {
			0
		};

	write_box(buf, b"saiz", |buf| {
		put_full_header(buf, 0, 0);
		buf.put_u8(sample_info_size);
		buf.put_u32(1); // sample_count
	});

	let omit_saio = is_audio && protection.scheme == Scheme::Cbcs;
	if !omit_saio {
		write_box(buf, b"saio", |buf| {
			put_full_header(buf, 0, 0);
			buf.put_u32(1); // entry_count
			// Offset from the start of this box's FullBox header to the
			// `senc` sample auxiliary data; `senc`'s own per-sample data
			// begins right after its (version,flags,sample_count) header.
			buf.put_u32(8);
		});
	}

	write_box(buf, b"senc", |buf| {
		let flags = if has_subsamples { 0x0000_0002 } else { 0 };
		put_full_header(buf, 0, flags);
		buf.put_u32(1); // sample_count

		if let Some(iv) = iv {
			buf.put_slice(&iv);
		}

		if let Some(sub_samples) = &sample.sub_samples {
			buf.put_u16(sub_samples.len() as u16);
			for s in sub_samples {
				buf.put_u16(s.clear_bytes);
				buf.put_u32(s.encrypted_bytes);
			}
		}
	});
}
