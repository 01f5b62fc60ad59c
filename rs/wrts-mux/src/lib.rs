//! Fragmented ISO-BMFF (CMAF) writer for a single media track.
//!
//! [`CmafMux`] turns [`wrts_demux::Sample`]s into CMAF-compatible
//! initialization segments and media fragments, suitable for feeding a
//! Media Source Extensions `SourceBuffer` or writing to disk.

mod boxes;
mod error;
mod mux;
mod protection;
mod track;

pub use error::{Error, Result};
pub use mux::CmafMux;
pub use protection::{Pssh, Protection, Scheme};
pub use track::{Codec, Resolution, TrackInfo};

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use wrts_demux::Sample;

	use super::*;

	fn h264_track() -> TrackInfo {
		TrackInfo {
			codec: Codec::H264,
			config: Bytes::from_static(&[0x01, 0x64, 0x00, 0x1f]),
			resolution: Some(Resolution { width: 1280, height: 720 }),
			channels: None,
			sample_rate: None,
		}
	}

	fn aac_track() -> TrackInfo {
		TrackInfo {
			codec: Codec::Aac,
			config: Bytes::from_static(&[0x11, 0x90]),
			resolution: None,
			channels: Some(2),
			sample_rate: Some(48_000),
		}
	}

	fn find_box<'a>(mut data: &'a [u8], path: &[&[u8; 4]]) -> &'a [u8] {
		let (&target, rest_path) = path.split_first().expect("path must not be empty");
		loop {
			assert!(data.len() >= 8, "ran out of bytes looking for box {:?}", String::from_utf8_lossy(target));
			let size = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
			let fourcc = &data[4..8];
			let body = &data[8..size];
			if fourcc == target {
				return if rest_path.is_empty() { body } else { find_box(body, rest_path) };
			}
			data = &data[size..];
		}
	}

	#[test]
	fn init_segment_uses_track_id_one_throughout() {
		let mux = CmafMux::new(h264_track());
		let init = mux.init(None).expect("init segment");

		let tkhd = find_box(&init, &[b"moov", b"trak", b"tkhd"]);
		// version(1) + flags(3) + creation_time(4) + modification_time(4) = 12,
		// track_ID follows immediately.
		let track_id = u32::from_be_bytes(tkhd[12..16].try_into().unwrap());
		assert_eq!(track_id, 1);

		let trex = find_box(&init, &[b"moov", b"mvex", b"trex"]);
		// version(1) + flags(3) = 4, track_ID follows.
		let track_id = u32::from_be_bytes(trex[4..8].try_into().unwrap());
		assert_eq!(track_id, 1);
	}

	#[test]
	fn keyframe_sample_sets_sync_flags_and_matching_base_decode_time() {
		let mut mux = CmafMux::new(h264_track());
		let sample = Sample {
			time: 12_345,
			duration: 40,
			data: Bytes::from_static(&[0xAB]),
			composition_offset: Some(10),
			is_key_frame: Some(true),
			sub_samples: None,
		};

		let frag = mux.write(&sample, None).expect("fragment");

		let tfdt = find_box(&frag, &[b"moof", b"traf", b"tfdt"]);
		// version 1: version(1) + flags(3) then a 64-bit base_media_decode_time.
		let base_decode_time = u64::from_be_bytes(tfdt[4..12].try_into().unwrap());
		assert_eq!(base_decode_time, sample.time);

		let trun = find_box(&frag, &[b"moof", b"traf", b"trun"]);
		// version(1)+flags(3)+sample_count(4)+data_offset(4) = 12, then
		// duration(4)+size(4)+flags(4)+composition_offset(4).
		let sample_flags = u32::from_be_bytes(trun[20..24].try_into().unwrap());
		assert_eq!(sample_flags, 0x0200_0000);
		let composition_offset = i32::from_be_bytes(trun[24..28].try_into().unwrap());
		assert_eq!(composition_offset, 10);

		let mdat = find_box(&frag, &[b"mdat"]);
		assert_eq!(mdat, &[0xAB]);
	}

	#[test]
	fn non_keyframe_video_sample_is_not_marked_sync() {
		let mut mux = CmafMux::new(h264_track());
		let sample = Sample {
			time: 0,
			duration: 40,
			data: Bytes::from_static(&[0x01, 0x02, 0x03]),
			composition_offset: None,
			is_key_frame: Some(false),
			sub_samples: None,
		};

		let frag = mux.write(&sample, None).expect("fragment");
		let trun = find_box(&frag, &[b"moof", b"traf", b"trun"]);
		let sample_flags = u32::from_be_bytes(trun[20..24].try_into().unwrap());
		assert_eq!(sample_flags, 0x0101_0000);
	}

	#[test]
	fn audio_samples_are_always_marked_sync() {
		let mut mux = CmafMux::new(aac_track());
		let sample = Sample {
			time: 0,
			duration: 1024,
			data: Bytes::from_static(&[0x00; 4]),
			composition_offset: None,
			is_key_frame: None,
			sub_samples: None,
		};

		let frag = mux.write(&sample, None).expect("fragment");
		let trun = find_box(&frag, &[b"moof", b"traf", b"trun"]);
		let sample_flags = u32::from_be_bytes(trun[20..24].try_into().unwrap());
		assert_eq!(sample_flags, 0x0200_0000);
	}

	#[test]
	fn fragment_sequence_numbers_increase_from_one() {
		let mut mux = CmafMux::new(aac_track());
		let sample = Sample {
			time: 0,
			duration: 1024,
			data: Bytes::from_static(&[0x00]),
			composition_offset: None,
			is_key_frame: None,
			sub_samples: None,
		};

		let first = mux.write(&sample, None).unwrap();
		let second = mux.write(&sample, None).unwrap();

		let mfhd1 = find_box(&first, &[b"moof", b"mfhd"]);
		let mfhd2 = find_box(&second, &[b"moof", b"mfhd"]);
		assert_eq!(u32::from_be_bytes(mfhd1[4..8].try_into().unwrap()), 1);
		assert_eq!(u32::from_be_bytes(mfhd2[4..8].try_into().unwrap()), 2);
	}

	#[test]
	fn protected_video_uses_encv_sample_entry_and_writes_senc() {
		let protection = Protection {
			scheme: Scheme::Cbcs,
			key_id: [0x11; 16],
			iv: Some([0x22; 16]),
			pssh: vec![],
		};

		let mux = CmafMux::new(h264_track());
		let init = mux.init(Some(&protection)).expect("init segment");
		// encv sample entry should exist where avc1 would otherwise be.
		let _ = find_box(&init, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd", b"encv"]);

		let mut mux = mux;
		let sample = Sample {
			time: 0,
			duration: 40,
			data: Bytes::from_static(&[0xAA, 0xBB]),
			composition_offset: None,
			is_key_frame: Some(true),
			sub_samples: Some(vec![wrts_demux::SubSample { clear_bytes: 0, encrypted_bytes: 2 }]),
		};
		let frag = mux.write(&sample, Some(&protection)).expect("protected fragment");
		let _ = find_box(&frag, &[b"moof", b"traf", b"senc"]);
	}
}
