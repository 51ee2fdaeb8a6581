//! Newline-delimited JSON framing.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtoError;

/// Reads the next frame from `input`.
///
/// Blank lines are skipped. Returns `Ok(None)` at end of stream. A line that
/// fails to decode yields [`ProtoError::Decode`] and leaves the stream
/// positioned at the next line.
pub async fn read_message<T>(input: &mut (impl AsyncBufRead + Unpin)) -> Result<Option<T>, ProtoError>
where
	T: DeserializeOwned,
{
	let mut line = String::new();
	loop {
		line.clear();
		if input.read_line(&mut line).await? == 0 {
			return Ok(None);
		}
		let trimmed = line.trim();
		if trimmed.is_empty() {
			continue;
		}
		return serde_json::from_str(trimmed).map(Some).map_err(ProtoError::Decode);
	}
}

/// Writes one frame followed by a newline and flushes.
///
/// Returns the number of bytes written.
pub async fn write_message<T>(output: &mut (impl AsyncWrite + Unpin), msg: &T) -> Result<usize, ProtoError>
where
	T: Serialize,
{
	let mut buf = serde_json::to_vec(msg).map_err(ProtoError::Encode)?;
	buf.push(b'\n');
	output.write_all(&buf).await?;
	output.flush().await?;
	Ok(buf.len())
}
