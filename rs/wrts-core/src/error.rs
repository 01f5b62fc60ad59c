use std::sync::Arc;

/// Fatal, retryable-once-then-fatal timeouts. All close the session and
/// surface through [`crate::player::Player::on_stop`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
	#[error("no first sample within the start timeout")]
	StartTimeout,
	#[error("media source never opened")]
	ConnectionTimeout,
	#[error("no data received while stalled")]
	DataTimeout,
}

/// Errors raised by a [`crate::source::Source`] implementation. Fatal for the
/// source; the owning [`crate::player::Player`] stops.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum SourceError {
	#[error("unexpected issue: {0}")]
	UnexpectedIssue(String),

	#[error("request error: {0}")]
	RequestError(String),

	#[error("malformed payload: {0}")]
	MalformedPayload(String),

	/// Synthesized from a [`SourceError::RequestError`] whose detail starts
	/// with `stream open failed` or `404`.
	#[error("resource unavailable: {0}")]
	ResourceUnavailable(String),
}

impl SourceError {
	/// Wraps a transport-level failure, promoting it to
	/// [`SourceError::ResourceUnavailable`] when its detail marks the
	/// resource as gone rather than merely unreachable.
	pub fn from_request_detail(detail: impl Into<String>) -> Self {
		let detail = detail.into();
		if detail.starts_with("stream open failed") || detail.starts_with("404") {
			SourceError::ResourceUnavailable(detail)
		} else {
			SourceError::RequestError(detail)
		}
	}
}

/// Errors from [`wrts_demux::RtsDemux`], fatal for the demuxer; close the
/// owning source.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum ReaderError {
	#[error("invalid payload: {0}")]
	InvalidPayload(#[from] wrts_demux::Error),

	#[error("unknown format byte {0}")]
	UnknownFormat(u8),

	#[error("unsupported format: {0}")]
	UnsupportedFormat(String),

	#[error("track {0} not found in metadata")]
	UnfoundTrack(i64),
}

/// Errors from [`wrts_mux::CmafMux`]; fatal, close playback for the track.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum CmafWriterError {
	#[error(transparent)]
	Inner(#[from] wrts_mux::Error),
}

/// Errors surfaced from the platform media sink, funneled through
/// [`crate::playback::Playback`].
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum MediaBufferError {
	#[error("source buffer append was aborted")]
	SourceBufferAborted,

	#[error("track has no metadata to initialize a SourceBuffer")]
	TrackWithoutMetadata,

	#[error("append buffer issue: {0}")]
	AppendBufferIssue(String),

	/// Recoverable: the Player advances the playhead by 10s or un-pauses to
	/// free buffer space.
	#[error("exceeds buffer size")]
	ExceedsBufferSize,
}

impl MediaBufferError {
	pub fn is_recoverable(&self) -> bool {
		matches!(self, MediaBufferError::ExceedsBufferSize)
	}
}

/// A media-element error, always fatal.
#[derive(Debug, thiserror::Error, Clone)]
#[error("playback error: {0}")]
pub struct PlaybackError(pub String);

/// Top-level error union surfaced to `on_stop`.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum Error {
	#[error("timeout: {0}")]
	Timeout(#[from] TimeoutError),

	#[error("source error: {0}")]
	Source(#[from] SourceError),

	#[error("reader error: {0}")]
	Reader(#[from] ReaderError),

	#[error("cmaf writer error: {0}")]
	CmafWriter(#[from] CmafWriterError),

	#[error("media buffer error: {0}")]
	MediaBuffer(#[from] MediaBufferError),

	#[error("playback error: {0}")]
	Playback(#[from] PlaybackError),

	#[error("http error: {0}")]
	Http(Arc<reqwest::Error>),

	#[error("json error: {0}")]
	Json(Arc<serde_json::Error>),

	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		Error::Http(Arc::new(err))
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Json(Arc::new(err))
	}
}

impl From<wrts_mux::Error> for Error {
	fn from(err: wrts_mux::Error) -> Self {
		Error::CmafWriter(CmafWriterError::Inner(err))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
