use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use shepherd_proto::{
	Invoke, PrimaryMessage, SerializedError, TransactionId, TransactionTracker, WorkerId, WorkerMessage, read_message,
	write_message,
};
use shepherd_runtime::{TaskClass, spawn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::LinkError;

type ReplyTx = oneshot::Sender<Result<Option<Value>, SerializedError>>;
type Pending = Arc<Mutex<TransactionTracker<ReplyTx>>>;

/// A broadcast event pushed by the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub txid: TransactionId,
	pub command: String,
	pub payload: Value,
}

/// Worker end of the command channel.
///
/// Cheap to clone. Invocations are correlated with replies by transaction id,
/// so any number may be in flight at once.
#[derive(Debug, Clone)]
pub struct WorkerLink {
	pid: WorkerId,
	outbound: mpsc::UnboundedSender<WorkerMessage>,
	pending: Pending,
}

impl WorkerLink {
	/// Connects over arbitrary streams. Returns the link and the stream of
	/// events, which ends when the primary closes `reader`.
	pub fn connect<R, W>(pid: WorkerId, reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<Event>)
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (outbound, rx) = mpsc::unbounded_channel();
		let (events_tx, events) = mpsc::unbounded_channel();
		let pending: Pending = Arc::default();

		spawn(TaskClass::Io, "link.writer", write_loop(writer, rx));
		spawn(TaskClass::Io, "link.reader", read_loop(reader, events_tx, Arc::clone(&pending)));

		(Self { pid, outbound, pending }, events)
	}

	/// Connects over the process's stdin and stdout.
	pub fn stdio() -> (Self, mpsc::UnboundedReceiver<Event>) {
		Self::connect(WorkerId(std::process::id()), tokio::io::stdin(), tokio::io::stdout())
	}

	pub fn pid(&self) -> WorkerId {
		self.pid
	}

	/// Tells the primary this worker is ready to serve.
	///
	/// # Errors
	///
	/// Returns [`LinkError::Closed`] if the channel is gone.
	pub fn online(&self) -> Result<(), LinkError> {
		self.outbound
			.send(WorkerMessage::Online { pid: self.pid })
			.map_err(|_| LinkError::Closed)
	}

	/// Runs a primary command and waits for its reply.
	///
	/// # Errors
	///
	/// [`LinkError::Remote`] carries the handler's error;
	/// [`LinkError::Closed`] means the primary went away first.
	pub async fn invoke(&self, command: &str, payload: Value) -> Result<Option<Value>, LinkError> {
		let (tx, rx) = oneshot::channel();
		let txid = {
			let mut pending = self.pending.lock();
			let txid = pending.next_id();
			if pending.register(txid.clone(), tx).is_err() {
				return Err(LinkError::Closed);
			}
			txid
		};
		tracing::trace!(%txid, command, "link.invoke");

		let msg = WorkerMessage::Invoke(Invoke {
			txid: txid.clone(),
			pid: self.pid,
			command: command.to_owned(),
			payload: Some(payload),
		});
		if self.outbound.send(msg).is_err() {
			self.pending.lock().resolve(&txid);
			return Err(LinkError::Closed);
		}

		match rx.await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(err)) => Err(LinkError::Remote(err)),
			Err(_) => Err(LinkError::Closed),
		}
	}

	/// Number of invocations awaiting a reply.
	pub fn in_flight(&self) -> usize {
		self.pending.lock().len()
	}
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WorkerMessage>)
where
	W: AsyncWrite + Unpin,
{
	while let Some(msg) = rx.recv().await {
		if let Err(error) = write_message(&mut writer, &msg).await {
			tracing::warn!(%error, "link.write.failed");
			break;
		}
	}
}

async fn read_loop<R>(reader: R, events: mpsc::UnboundedSender<Event>, pending: Pending)
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(reader);
	loop {
		match read_message::<PrimaryMessage>(&mut reader).await {
			Ok(Some(PrimaryMessage::Reply { txid, error, value, .. })) => {
				let Some(tx) = pending.lock().resolve(&txid) else {
					continue;
				};
				let _ = tx.send(match error {
					Some(err) => Err(err),
					None => Ok(value),
				});
			}
			Ok(Some(PrimaryMessage::Event { txid, command, payload })) => {
				let _ = events.send(Event { txid, command, payload });
			}
			Ok(None) => break,
			Err(error) if error.is_recoverable() => tracing::warn!(%error, "link.decode.failed"),
			Err(error) => {
				tracing::warn!(%error, "link.read.failed");
				break;
			}
		}
	}
	let abandoned = pending.lock().drain().count();
	tracing::debug!(abandoned, "link.closed");
}
