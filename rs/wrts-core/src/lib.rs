//! Orchestration core of a WRTS client: normalized stream metadata, the
//! pull-based adaptive source, the playback buffer state machine, and the
//! `Player` that ties them together.
//!
//! Byte-level wire protocols live in the sibling crates [`wrts_demux`] (RTS
//! container) and [`wrts_mux`] (CMAF fragment writer); this crate is the
//! glue that decides *when* to fetch, *which* rendition, and *how* to feed
//! the result to a platform media sink.

pub mod adaptive_retry;
pub mod buffer_state;
pub mod cancel;
pub mod cmcd;
pub mod environment;
pub mod error;
pub mod media_buffer;
pub mod metadata;
pub mod playback;
pub mod player;
pub mod source;
pub mod track;

pub use environment::Environment;
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use player::Player;
pub use track::{Resolution, Track, TrackKind};
