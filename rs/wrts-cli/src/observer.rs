//! Logs every callback a [`wrts_core::player::Player`] drives; this binary
//! has no UI to forward them to.

use wrts_core::buffer_state::BufferState;
use wrts_core::player::PlayerObserver;
use wrts_core::{Error, Metadata};

#[derive(Default)]
pub struct TracingObserver;

impl PlayerObserver for TracingObserver {
	fn on_metadata(&mut self, metadata: &Metadata) {
		tracing::info!(
			audio = metadata.audio_tracks().count(),
			video = metadata.video_tracks().count(),
			data = metadata.data_tracks().count(),
			"metadata"
		);
	}

	fn on_state(&mut self, state: BufferState) {
		tracing::info!(?state, "buffer state changed");
	}

	fn on_stall(&mut self) {
		tracing::warn!("stalled");
	}

	fn on_resume(&mut self) {
		tracing::info!("resumed");
	}

	fn on_go_live(&mut self) {
		tracing::debug!("seeked to the live edge");
	}

	fn on_audio_skipping(&mut self, delta_ms: u64) {
		tracing::debug!(delta_ms, "audio frame skip");
	}

	fn on_video_skipping(&mut self, delta_ms: u64) {
		tracing::debug!(delta_ms, "video frame skip");
	}

	fn on_data(&mut self, track_id: u32, time: u64, payload: serde_json::Value) {
		tracing::info!(track_id, time, %payload, "data message");
	}

	fn on_stop(&mut self, err: Option<&Error>) {
		match err {
			Some(err) => tracing::error!(%err, "session stopped with an error"),
			None => tracing::info!("session stopped"),
		}
	}
}
