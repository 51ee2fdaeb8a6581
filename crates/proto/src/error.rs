//! Codec errors.

use thiserror::Error;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum ProtoError {
	/// The underlying pipe failed.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// A frame was not valid JSON or did not match the protocol.
	#[error("malformed frame: {0}")]
	Decode(#[source] serde_json::Error),
	/// A message could not be encoded.
	#[error("failed to encode frame: {0}")]
	Encode(#[source] serde_json::Error),
}

impl ProtoError {
	/// Returns true if the stream is still usable after this error.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Self::Decode(_))
	}
}
