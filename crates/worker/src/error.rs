use shepherd_proto::SerializedError;
use thiserror::Error;

/// Errors surfaced to worker code.
#[derive(Debug, Error)]
pub enum LinkError {
	/// The primary closed the channel before replying.
	#[error("command channel closed")]
	Closed,
	/// The primary's handler reported an error.
	#[error("command failed: {0}")]
	Remote(#[from] SerializedError),
	#[error("no environment snapshot in {}", shepherd_proto::WORKER_ENV_VAR)]
	MissingSnapshot,
	#[error("malformed environment snapshot: {0}")]
	InvalidSnapshot(#[source] serde_json::Error),
}

impl LinkError {
	/// Code attached by the primary, if any.
	pub fn code(&self) -> Option<&str> {
		match self {
			Self::Remote(err) => err.code.as_deref(),
			_ => None,
		}
	}
}
