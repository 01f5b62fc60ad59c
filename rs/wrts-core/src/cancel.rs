//! A single-owner cancellation token for the independently abortable request
//! slots described in §5: "every pending request belongs to exactly one
//! token... cancelling a token aborts its body read."
//!
//! This is deliberately narrower than `tokio_util::sync::CancellationToken`:
//! one token is retired and replaced per request rather than shared across a
//! tree of children, which is all [`super::source::http_adaptive`] needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
	cancelled: Arc<AtomicBool>,
	notify: Arc<Notify>,
}

/// What happened to a future raced against a [`CancelToken`].
#[derive(Debug)]
pub enum Outcome<T> {
	Aborted,
	Done(T),
}

impl<T> Outcome<T> {
	pub fn is_aborted(&self) -> bool {
		matches!(self, Outcome::Aborted)
	}
}

impl CancelToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// Clear a prior cancellation so the same slot can be reused for the
	/// next request (§4.5's four in-flight tokens are reused across
	/// sequences rather than reallocated).
	pub fn reset(&self) {
		self.cancelled.store(false, Ordering::SeqCst);
	}

	/// Resolves once [`Self::cancel`] has been called. Resolves immediately
	/// if it already has been.
	pub async fn cancelled(&self) {
		if self.is_cancelled() {
			return;
		}
		// Re-check after registering, in case `cancel` ran between the
		// `is_cancelled` check above and `notified()` subscribing.
		let notified = self.notify.notified();
		if self.is_cancelled() {
			return;
		}
		notified.await;
	}

	/// Race `fut` against cancellation. Body reads, manifest fetches and
	/// "up" probes are all awaited this way so a cancellation is observable
	/// as [`Outcome::Aborted`] rather than the future ever completing.
	pub async fn race<T>(&self, fut: impl std::future::Future<Output = T>) -> Outcome<T> {
		tokio::select! {
			biased;
			_ = self.cancelled() => Outcome::Aborted,
			value = fut => Outcome::Done(value),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn race_returns_done_when_not_cancelled() {
		let token = CancelToken::new();
		let outcome = token.race(async { 42 }).await;
		assert!(matches!(outcome, Outcome::Done(42)));
	}

	#[tokio::test]
	async fn race_returns_aborted_once_cancelled() {
		let token = CancelToken::new();
		token.cancel();
		let outcome = token.race(std::future::pending::<()>()).await;
		assert!(outcome.is_aborted());
	}

	#[tokio::test]
	async fn cancel_wakes_an_already_waiting_race() {
		let token = CancelToken::new();
		let waiter = token.clone();
		let handle = tokio::spawn(async move { waiter.race(tokio::time::sleep(Duration::from_secs(30))).await.is_aborted() });
		tokio::time::sleep(Duration::from_millis(10)).await;
		token.cancel();
		assert!(handle.await.unwrap());
	}
}
