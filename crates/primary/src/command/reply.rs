use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use shepherd_proto::{TransactionId, WorkerId};
use tokio::sync::mpsc;

use super::{CommandError, Outcome};

/// A finished invocation, ready to be framed as a reply.
#[derive(Debug)]
pub struct Completion {
	pub txid: TransactionId,
	pub pid: WorkerId,
	pub outcome: Outcome,
}

type Sink = Box<dyn Fn(Completion) + Send + Sync>;

struct ReplyInner {
	txid: TransactionId,
	pid: WorkerId,
	sent: AtomicBool,
	sink: Sink,
}

impl Drop for ReplyInner {
	fn drop(&mut self) {
		if !self.sent.load(Ordering::Acquire) {
			tracing::warn!(txid = %self.txid, pid = %self.pid, "command.reply.dropped");
		}
	}
}

/// Single-shot reply handle for one invocation.
///
/// Clones share the same shot: the first [`Reply::send`] wins and every later
/// call is discarded. Completions are queued to the primary's event loop, so
/// the reply frame is always written on a later turn than the handler call.
#[derive(Clone)]
pub struct Reply {
	inner: Arc<ReplyInner>,
}

impl Reply {
	/// Creates a reply that hands its completion to `sink`.
	pub fn new(txid: TransactionId, pid: WorkerId, sink: impl Fn(Completion) + Send + Sync + 'static) -> Self {
		Self {
			inner: Arc::new(ReplyInner {
				txid,
				pid,
				sent: AtomicBool::new(false),
				sink: Box::new(sink),
			}),
		}
	}

	/// Creates a reply whose completion is delivered to the returned receiver.
	pub fn channel(txid: TransactionId, pid: WorkerId) -> (Self, mpsc::UnboundedReceiver<Completion>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let reply = Self::new(txid, pid, move |completion| {
			let _ = tx.send(completion);
		});
		(reply, rx)
	}

	/// Delivers the outcome. Returns false if a reply was already sent.
	pub fn send(&self, outcome: Outcome) -> bool {
		if self.inner.sent.swap(true, Ordering::AcqRel) {
			tracing::debug!(txid = %self.inner.txid, "command.reply.duplicate");
			return false;
		}
		(self.inner.sink)(Completion {
			txid: self.inner.txid.clone(),
			pid: self.inner.pid,
			outcome,
		});
		true
	}

	/// Replies with a value.
	pub fn ok(&self, value: Value) -> bool {
		self.send(Ok(Some(value)))
	}

	/// Replies with no value.
	pub fn done(&self) -> bool {
		self.send(Ok(None))
	}

	/// Replies with an error.
	pub fn err(&self, err: impl Into<CommandError>) -> bool {
		self.send(Err(err.into()))
	}

	pub fn is_sent(&self) -> bool {
		self.inner.sent.load(Ordering::Acquire)
	}

	pub fn txid(&self) -> &TransactionId {
		&self.inner.txid
	}

	pub fn pid(&self) -> WorkerId {
		self.inner.pid
	}
}

impl fmt::Debug for Reply {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Reply")
			.field("txid", &self.inner.txid)
			.field("pid", &self.inner.pid)
			.field("sent", &self.is_sent())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn second_send_is_discarded() {
		let (reply, mut rx) = Reply::channel("t1".into(), WorkerId(4));
		let twin = reply.clone();

		assert!(reply.ok(json!(1)));
		assert!(!twin.ok(json!(2)));
		assert!(!reply.err(CommandError::failed("late")));

		let first = rx.try_recv().unwrap();
		assert_eq!(first.txid, TransactionId::from("t1"));
		assert_eq!(first.pid, WorkerId(4));
		assert_eq!(first.outcome.unwrap(), Some(json!(1)));
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn sent_state_is_shared_across_clones() {
		let (reply, _rx) = Reply::channel("t2".into(), WorkerId(1));
		let twin = reply.clone();
		assert!(!twin.is_sent());
		reply.done();
		assert!(twin.is_sent());
	}
}
