//! Throttled state-change broadcasts to the worker pool.

use std::time::Duration;

use serde_json::json;
use shepherd_proto::{ENV_UPDATE, FLUSH_CACHE};
use shepherd_runtime::Throttle;

use crate::supervisor::Supervisor;

/// Minimum spacing between two broadcasts of the same kind.
///
/// The admin decree flow waits slightly longer than this after changing the
/// environment before it reports success, so workers have the new state by
/// then. Changing the value requires changing that wait too.
pub const BROADCAST_THROTTLE_WINDOW: Duration = Duration::from_millis(250);

/// The environment-changed and cache-flushed triggers.
#[derive(Debug, Clone)]
pub struct EnvBroadcasts {
	env_changed: Throttle,
	cache_flushed: Throttle,
}

impl EnvBroadcasts {
	/// Spawns both throttles and registers them on the environment's signals.
	///
	/// The throttles hold the supervisor weakly: the environment owns the
	/// triggers, so they stop once the supervisor and every other environment
	/// handle are dropped.
	pub fn install(supervisor: &Supervisor) -> Self {
		let env = supervisor.env();

		let weak = supervisor.downgrade();
		let env_changed = Throttle::spawn("broadcast.env_update", BROADCAST_THROTTLE_WINDOW, move || {
			let Some(sup) = weak.upgrade() else {
				return;
			};
			let snapshot = sup.env().snapshot();
			tracing::info!(version = snapshot.version, "WORKER_ENV_UPDATE");
			match serde_json::to_value(&snapshot) {
				Ok(payload) => {
					sup.broadcast(ENV_UPDATE, payload);
				}
				Err(error) => tracing::error!(%error, "broadcast.env_update.encode"),
			}
		});

		let weak = supervisor.downgrade();
		let cache_flushed = Throttle::spawn("broadcast.flush_cache", BROADCAST_THROTTLE_WINDOW, move || {
			let Some(sup) = weak.upgrade() else {
				return;
			};
			let key = sup.env().fresh_key();
			tracing::info!(fresh_key = key, "WORKER_CACHE_FLUSH");
			sup.broadcast(FLUSH_CACHE, json!(key));
		});

		let trigger = env_changed.clone();
		env.on_env_updated().reg(move || trigger.trigger());
		let trigger = cache_flushed.clone();
		env.on_cache_flushed().reg(move || trigger.trigger());

		Self { env_changed, cache_flushed }
	}

	/// Forces an `ENV_UPDATE` broadcast, subject to the throttle window.
	pub fn env_changed(&self) {
		self.env_changed.trigger();
	}

	/// Forces a `FLUSH_CACHE` broadcast, subject to the throttle window.
	pub fn cache_flushed(&self) {
		self.cache_flushed.trigger();
	}
}
