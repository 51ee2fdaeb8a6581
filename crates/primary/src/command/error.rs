use shepherd_proto::SerializedError;
use thiserror::Error;

use crate::quota::QuotaError;

/// Failure reported by a command handler.
///
/// Converted to a [`SerializedError`] before it crosses the process boundary.
#[derive(Debug, Error)]
pub enum CommandError {
	/// No handler is registered under the invoked name.
	#[error("no handler for command {0:?}")]
	Unhandled(String),
	/// The handler panicked before replying.
	#[error("command handler panicked: {0}")]
	Panicked(String),
	/// Refreshing quota limits failed.
	#[error(transparent)]
	Quota(#[from] QuotaError),
	/// Any other handler failure.
	#[error("{message}")]
	Failed {
		/// Human-readable message.
		message: String,
		/// Optional machine-readable code.
		code: Option<String>,
	},
}

impl CommandError {
	/// Creates a [`CommandError::Failed`] without a code.
	pub fn failed(message: impl Into<String>) -> Self {
		Self::Failed { message: message.into(), code: None }
	}

	/// Creates a [`CommandError::Failed`] with a code.
	pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::Failed {
			message: message.into(),
			code: Some(code.into()),
		}
	}

	/// Stable code sent to workers.
	pub fn code(&self) -> Option<&str> {
		match self {
			Self::Unhandled(_) => Some("UNHANDLED_COMMAND"),
			Self::Panicked(_) => Some("HANDLER_PANIC"),
			Self::Quota(err) => Some(err.code()),
			Self::Failed { code, .. } => code.as_deref(),
		}
	}

	/// Transport-safe projection.
	pub fn to_serialized(&self) -> SerializedError {
		let err = SerializedError::new(self.to_string());
		match self.code() {
			Some(code) => err.with_code(code),
			None => err,
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn unhandled_serializes_with_code() {
		let err = CommandError::Unhandled("NOPE".to_owned()).to_serialized();
		assert_eq!(err.code.as_deref(), Some("UNHANDLED_COMMAND"));
		assert!(err.message.contains("NOPE"));
	}

	#[test]
	fn failed_without_code_has_none() {
		let err = CommandError::failed("boom").to_serialized();
		assert_eq!(err, SerializedError::new("boom"));
	}
}
