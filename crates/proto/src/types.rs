//! Frames exchanged between the primary and its workers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque correlation token pairing one invoke with its one reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub String);

impl TransactionId {
	/// Generates a random id. Callers needing uniqueness against outstanding
	/// ids go through [`crate::TransactionTracker::next_id`].
	#[must_use]
	pub fn random() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	/// Returns the id as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TransactionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for TransactionId {
	fn from(value: &str) -> Self {
		Self(value.to_owned())
	}
}

/// Operating-system process id of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A command invocation sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoke {
	/// Correlation id chosen by the worker.
	pub txid: TransactionId,
	/// Process id of the sending worker, echoed back in the reply.
	pub pid: WorkerId,
	/// Registered command name.
	pub command: String,
	/// Command arguments. Invokes without a payload are malformed and ignored.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<Value>,
}

/// Worker → primary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
	/// The worker finished booting and is ready to serve traffic.
	Online {
		/// Process id of the worker.
		pid: WorkerId,
	},
	/// The worker asks the primary to run a command.
	Invoke(Invoke),
}

/// Primary → worker frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimaryMessage {
	/// The single answer to one [`Invoke`].
	Reply {
		/// Id of the invoke being answered.
		txid: TransactionId,
		/// Process id from the invoke.
		pid: WorkerId,
		/// Handler failure, if any.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<SerializedError>,
		/// Handler result, if any.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		value: Option<Value>,
	},
	/// Fire-and-forget broadcast. Workers never reply to events.
	Event {
		/// Fresh id, unique among the primary's outstanding ids.
		txid: TransactionId,
		/// Event name, e.g. [`crate::ENV_UPDATE`].
		command: String,
		/// Event data.
		payload: Value,
	},
}

impl PrimaryMessage {
	/// Returns the transaction id carried by either variant.
	pub fn txid(&self) -> &TransactionId {
		match self {
			Self::Reply { txid, .. } | Self::Event { txid, .. } => txid,
		}
	}
}

/// Transport-safe projection of a handler error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
	/// Human-readable message.
	pub message: String,
	/// Stable machine-readable code, when the error has one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl SerializedError {
	/// Creates an error with a message and no code.
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into(), code: None }
	}

	/// Attaches a machine-readable code.
	#[must_use]
	pub fn with_code(mut self, code: impl Into<String>) -> Self {
		self.code = Some(code.into());
		self
	}
}

impl fmt::Display for SerializedError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.code {
			Some(code) => write!(f, "{code}: {}", self.message),
			None => f.write_str(&self.message),
		}
	}
}

impl std::error::Error for SerializedError {}
