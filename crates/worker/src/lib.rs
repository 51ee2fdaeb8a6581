//! Worker-side end of the shepherd command bus.
//!
//! A worker reads its spawn-time [`EnvSnapshot`] with [`snapshot_from_env`],
//! connects a [`WorkerLink`] over stdio, announces itself with
//! [`WorkerLink::online`], and then applies primary events to its
//! [`WorkerState`] until the primary closes the channel.

mod error;
mod link;
mod state;

pub use error::LinkError;
pub use link::{Event, WorkerLink};
use shepherd_proto::{EnvSnapshot, WORKER_ENV_VAR};
pub use state::{Applied, WorkerState, serve};

/// Reads the snapshot the primary passed at spawn time.
///
/// # Errors
///
/// Returns [`LinkError::MissingSnapshot`] outside a primary-launched process
/// and [`LinkError::InvalidSnapshot`] on malformed input.
pub fn snapshot_from_env() -> Result<EnvSnapshot, LinkError> {
	let raw = std::env::var(WORKER_ENV_VAR).map_err(|_| LinkError::MissingSnapshot)?;
	parse_snapshot(&raw)
}

fn parse_snapshot(raw: &str) -> Result<EnvSnapshot, LinkError> {
	serde_json::from_str(raw).map_err(LinkError::InvalidSnapshot)
}
