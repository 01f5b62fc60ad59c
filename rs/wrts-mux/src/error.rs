/// Errors from the CMAF fragment writer. Always fatal for the owning
/// playback buffer.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum Error {
	#[error("unsupported codec: {0}")]
	UnsupportedCodec(String),

	#[error("unsupported track type for CMAF muxing")]
	UnsupportedTrackType,

	#[error("invalid protection scheme: {0}")]
	InvalidScheme(String),

	#[error("invalid hex value: {0}")]
	Hex(#[from] hex::FromHexError),

	#[error("invalid base64 PSSH box: {0}")]
	Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
