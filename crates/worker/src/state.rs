use shepherd_proto::{ENV_UPDATE, EnvSnapshot, FLUSH_CACHE};
use tokio::sync::mpsc;

use crate::Event;

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
	/// A newer snapshot replaced the local copy.
	EnvUpdated { version: u64 },
	/// The snapshot was older than the local copy and was dropped.
	Stale { version: u64 },
	/// The freshness key rotated.
	CacheFlushed { fresh_key: u64 },
	/// The payload did not decode.
	Invalid,
	/// Unknown command.
	Ignored,
}

/// A worker's read-only, possibly stale view of the primary environment.
#[derive(Debug, Clone)]
pub struct WorkerState {
	snapshot: EnvSnapshot,
	flushes: u64,
}

impl WorkerState {
	pub fn new(snapshot: EnvSnapshot) -> Self {
		Self { snapshot, flushes: 0 }
	}

	pub fn snapshot(&self) -> &EnvSnapshot {
		&self.snapshot
	}

	/// Number of cache flushes observed.
	pub fn flushes(&self) -> u64 {
		self.flushes
	}

	pub fn apply(&mut self, event: &Event) -> Applied {
		match event.command.as_str() {
			ENV_UPDATE => match serde_json::from_value::<EnvSnapshot>(event.payload.clone()) {
				Ok(snapshot) if snapshot.version < self.snapshot.version => Applied::Stale {
					version: snapshot.version,
				},
				Ok(snapshot) => {
					let version = snapshot.version;
					self.snapshot = snapshot;
					Applied::EnvUpdated { version }
				}
				Err(error) => {
					tracing::warn!(txid = %event.txid, %error, "worker.env_update.invalid");
					Applied::Invalid
				}
			},
			FLUSH_CACHE => match event.payload.as_u64() {
				Some(fresh_key) => {
					self.snapshot.fresh_key = fresh_key;
					self.flushes += 1;
					Applied::CacheFlushed { fresh_key }
				}
				None => {
					tracing::warn!(txid = %event.txid, "worker.flush_cache.invalid");
					Applied::Invalid
				}
			},
			other => {
				tracing::debug!(txid = %event.txid, command = other, "worker.event.ignored");
				Applied::Ignored
			}
		}
	}
}

/// Applies events until the primary closes the channel.
pub async fn serve(mut events: mpsc::UnboundedReceiver<Event>, mut state: WorkerState) -> WorkerState {
	while let Some(event) = events.recv().await {
		let applied = state.apply(&event);
		tracing::debug!(command = %event.command, ?applied, "worker.event");
	}
	state
}
