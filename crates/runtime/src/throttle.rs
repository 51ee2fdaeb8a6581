//! Leading + trailing edge throttling.
//!
//! A [`Throttle`] runs its action at most once per window. The first trigger in
//! an idle period fires immediately. Triggers that arrive while a window is open
//! are coalesced into a single trailing fire at the end of that window. The
//! action reads whatever state is current when it runs, so the trailing fire
//! always observes the effects of the last trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use crate::{TaskClass, spawn};

/// Cloneable trigger handle for one throttled action.
///
/// The background task stops once every handle is dropped, after flushing a
/// pending trailing fire.
#[derive(Debug, Clone)]
pub struct Throttle {
	name: &'static str,
	tx: mpsc::UnboundedSender<()>,
}

impl Throttle {
	/// Spawns the throttle task on the current runtime.
	pub fn spawn(name: &'static str, window: Duration, action: impl Fn() + Send + Sync + 'static) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		spawn(TaskClass::Timer, name, run(name, window, rx, Arc::new(action)));
		Self { name, tx }
	}

	/// Requests one run of the action.
	pub fn trigger(&self) {
		if self.tx.send(()).is_err() {
			tracing::debug!(throttle = self.name, "throttle.closed");
		}
	}

	/// Name used in traces.
	pub fn name(&self) -> &'static str {
		self.name
	}
}

async fn run(name: &'static str, window: Duration, mut rx: mpsc::UnboundedReceiver<()>, action: Arc<dyn Fn() + Send + Sync>) {
	'idle: while rx.recv().await.is_some() {
		tracing::trace!(throttle = name, edge = "leading", "throttle.fire");
		action();
		let mut deadline = Instant::now() + window;
		let mut pending = false;

		loop {
			tokio::select! {
				msg = rx.recv() => match msg {
					Some(()) => pending = true,
					None => {
						if pending {
							sleep_until(deadline).await;
							tracing::trace!(throttle = name, edge = "trailing", "throttle.fire");
							action();
						}
						return;
					}
				},
				_ = sleep_until(deadline) => {
					if !pending {
						continue 'idle;
					}
					pending = false;
					tracing::trace!(throttle = name, edge = "trailing", "throttle.fire");
					action();
					deadline = Instant::now() + window;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;

	const W: Duration = Duration::from_millis(250);

	async fn settle() {
		for _ in 0..8 {
			tokio::task::yield_now().await;
		}
	}

	fn recording(state: Arc<AtomicU64>) -> (Throttle, Arc<Mutex<Vec<u64>>>) {
		let fired = Arc::new(Mutex::new(Vec::new()));
		let log = Arc::clone(&fired);
		let throttle = Throttle::spawn("test", W, move || {
			log.lock().unwrap().push(state.load(Ordering::SeqCst));
		});
		(throttle, fired)
	}

	#[tokio::test(start_paused = true)]
	async fn burst_fires_leading_then_one_trailing_with_latest_state() {
		let state = Arc::new(AtomicU64::new(0));
		let (throttle, fired) = recording(Arc::clone(&state));

		for n in 1..=5 {
			state.store(n, Ordering::SeqCst);
			throttle.trigger();
			settle().await;
		}
		assert_eq!(*fired.lock().unwrap(), vec![1], "only the leading edge fires inside the window");

		tokio::time::sleep(W).await;
		settle().await;
		assert_eq!(*fired.lock().unwrap(), vec![1, 5], "trailing edge sees the last trigger's state");

		tokio::time::sleep(W * 4).await;
		settle().await;
		assert_eq!(fired.lock().unwrap().len(), 2, "no further fires without triggers");
	}

	#[tokio::test(start_paused = true)]
	async fn idle_trigger_fires_immediately() {
		let state = Arc::new(AtomicU64::new(7));
		let (throttle, fired) = recording(state);

		throttle.trigger();
		settle().await;
		assert_eq!(*fired.lock().unwrap(), vec![7]);

		tokio::time::sleep(W * 2).await;
		throttle.trigger();
		settle().await;
		assert_eq!(*fired.lock().unwrap(), vec![7, 7], "window elapsed, so the next trigger is a new leading edge");
	}

	#[tokio::test(start_paused = true)]
	async fn trailing_fire_opens_a_new_window() {
		let state = Arc::new(AtomicU64::new(0));
		let (throttle, fired) = recording(state);

		throttle.trigger();
		throttle.trigger();
		settle().await;
		tokio::time::sleep(W).await;
		settle().await;
		assert_eq!(fired.lock().unwrap().len(), 2);

		// Within the window opened by the trailing fire: coalesced again.
		throttle.trigger();
		settle().await;
		assert_eq!(fired.lock().unwrap().len(), 2);
		tokio::time::sleep(W).await;
		settle().await;
		assert_eq!(fired.lock().unwrap().len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn dropping_handles_flushes_pending_trailing_fire() {
		let state = Arc::new(AtomicU64::new(0));
		let (throttle, fired) = recording(state);

		throttle.trigger();
		throttle.trigger();
		drop(throttle);
		settle().await;
		tokio::time::sleep(W).await;
		settle().await;
		assert_eq!(fired.lock().unwrap().len(), 2);
	}
}
