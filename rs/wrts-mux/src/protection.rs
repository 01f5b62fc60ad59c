use bytes::Bytes;

use crate::error::{Error, Result};

/// Content protection scheme, carried as a CMAF `schm` 4-CC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
	Cenc,
	Cbc1,
	Cens,
	Cbcs,
}

impl Scheme {
	pub fn fourcc(self) -> [u8; 4] {
		match self {
			Scheme::Cenc => *b"cenc",
			Scheme::Cbc1 => *b"cbc1",
			Scheme::Cens => *b"cens",
			Scheme::Cbcs => *b"cbcs",
		}
	}

	/// Per-sample IV size used in `tenc`: 16 bytes for every scheme except
	/// CBCS, which carries its IV inline in `tenc`/`senc` instead.
	pub fn per_sample_iv_size(self) -> u8 {
		match self {
			Scheme::Cbcs => 0,
			_ => 16,
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"cenc" => Ok(Scheme::Cenc),
			"cbc1" => Ok(Scheme::Cbc1),
			"cens" => Ok(Scheme::Cens),
			"cbcs" => Ok(Scheme::Cbcs),
			other => Err(Error::InvalidScheme(other.to_string())),
		}
	}
}

/// One DRM system's PSSH box, already-encoded and appended verbatim.
#[derive(Debug, Clone)]
pub struct Pssh {
	pub bytes: Bytes,
}

/// Content protection parameters for one track's encrypted rendition.
#[derive(Debug, Clone)]
pub struct Protection {
	pub scheme: Scheme,
	pub key_id: [u8; 16],
	/// 16-byte IV, as 32 hex chars on the wire. CBCS additionally embeds
	/// this IV in `tenc`; other schemes only use it per-sample in `senc`.
	pub iv: Option<[u8; 16]>,
	pub pssh: Vec<Pssh>,
}

impl Protection {
	/// CBCS video uses a default pattern of 1 encrypted block, 9 clear.
	pub const CBCS_DEFAULT_CRYPT_BYTE_BLOCK: u8 = 1;
	pub const CBCS_DEFAULT_SKIP_BYTE_BLOCK: u8 = 9;
}
