/// Errors produced while parsing the RTS wire container.
///
/// A [`Error`] is always fatal for the demuxer: the owning `Source` must
/// close, per the ReaderError taxonomy.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The buffer ended in the middle of a value; only ever surfaced where
	/// truncation cannot be tolerated (a framed packet, whose length is
	/// already known from the transport).
	#[error("truncated RTS packet")]
	Truncated,

	/// A control packet (`trackId == -1`) carried a `type` we don't
	/// recognize. Fatal: control packets define the shape of everything
	/// that follows.
	#[error("malformed control packet type {0}")]
	InvalidPayload(u8),

	/// The packet's `type`/`trackId` combination doesn't match any known
	/// packet form.
	#[error("unknown RTS packet format (type={0}, track={1})")]
	UnknownFormat(u8, i64),

	/// A media packet referenced a track that was never declared by an
	/// Init Tracks packet.
	#[error("unfound track {0}")]
	UnfoundTrack(i64),

	/// The metadata payload was not valid JSON.
	#[error("invalid metadata JSON: {0}")]
	InvalidJson(std::sync::Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::InvalidJson(std::sync::Arc::new(err))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
