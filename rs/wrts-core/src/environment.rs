//! Injectable host capabilities (§9 design notes: "global mutable state for
//! screen resolution" and the `ManagedMediaSource` feature check become an
//! environment handle instead of runtime platform detection inside the
//! core).

use crate::track::Resolution;

/// Host capabilities a [`crate::player::Player`] is constructed with.
///
/// Nothing in this crate probes the platform directly; a caller (the CLI,
/// or an embedding application) is responsible for filling this in and
/// refreshing [`Environment::max_resolution`] on resize.
#[derive(Debug, Clone, Copy)]
pub struct Environment {
	max_resolution: Option<Resolution>,
	/// Whether the platform exposes `ManagedMediaSource` (or an equivalent
	/// low-latency source buffer). When `false`, playback-rate adjustment
	/// and other sink-side features the core assumes are unavailable are
	/// suppressed rather than attempted.
	managed_media_source: bool,
	/// Sinks known to glitch audibly on a `playbackRate` change. When set,
	/// [`crate::buffer_state::dynamic_rate`] is never applied.
	rate_changes_glitch: bool,
}

impl Default for Environment {
	fn default() -> Self {
		Self { max_resolution: None, managed_media_source: true, rate_changes_glitch: false }
	}
}

impl Environment {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_resolution(mut self, resolution: Resolution) -> Self {
		self.max_resolution = Some(resolution);
		self
	}

	pub fn with_managed_media_source(mut self, enabled: bool) -> Self {
		self.managed_media_source = enabled;
		self
	}

	pub fn with_rate_changes_glitch(mut self, glitches: bool) -> Self {
		self.rate_changes_glitch = glitches;
		self
	}

	pub fn max_resolution(&self) -> Option<Resolution> {
		self.max_resolution
	}

	/// Called on the host's resize notification; a [`crate::player::Player`]
	/// caches a per-instance override on top of this.
	pub fn set_max_resolution(&mut self, resolution: Option<Resolution>) {
		self.max_resolution = resolution;
	}

	pub fn managed_media_source(&self) -> bool {
		self.managed_media_source
	}

	pub fn rate_changes_glitch(&self) -> bool {
		self.rate_changes_glitch
	}
}
