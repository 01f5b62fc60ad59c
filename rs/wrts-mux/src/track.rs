use bytes::Bytes;

/// Codec-specific parameters needed to build the `stsd` sample entry.
#[derive(Debug, Clone)]
pub enum Codec {
	/// AVC/H.264. `config` carries the raw `avcC`-style SPS/PPS record.
	H264,
	/// H.265/HEVC. `config` carries the raw `hvcC` record.
	H265,
	Aac,
	Mp3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
	pub width: u16,
	pub height: u16,
}

/// Everything [`crate::CmafMux::init`] needs to build the initialization
/// segment for one track.
#[derive(Debug, Clone)]
pub struct TrackInfo {
	pub codec: Codec,
	/// Decoder configuration record (avcC/hvcC payload for video, raw
	/// AudioSpecificConfig for AAC, empty for MP3).
	pub config: Bytes,
	pub resolution: Option<Resolution>,
	pub channels: Option<u16>,
	pub sample_rate: Option<u32>,
}

impl TrackInfo {
	pub fn is_video(&self) -> bool {
		matches!(self.codec, Codec::H264 | Codec::H265)
	}

	pub fn is_audio(&self) -> bool {
		matches!(self.codec, Codec::Aac | Codec::Mp3)
	}
}
