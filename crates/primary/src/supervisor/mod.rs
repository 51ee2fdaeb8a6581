//! Worker pool supervisor and the primary side of the command bus.
//!
//! One pump task owns event handling. Launchers, reply handles and timers
//! feed it through a single unbounded channel, so every state transition for
//! a slot happens on the pump in the order its events were produced.
//!
//! # Slot lifecycle
//!
//! `Launching → Online → (exited clean | exited crashed)`
//!
//! # Invariants
//!
//! | Invariant | Enforced in |
//! |---|---|
//! | A slot exists before any of its events is handled. | [`Supervisor::launch_worker`] (launch runs under the pool lock) |
//! | The online continuation runs once, when `ONLINE` arrives. | [`Pump::on_online`] |
//! | A crashed worker that never came online hands its continuation to its replacement. | [`Pump::on_exit`] |
//! | Clean exits are never relaunched; crashes are relaunched once with a fresh snapshot. | [`Pump::on_exit`] |
//! | At most one pending transaction per id per worker. | [`Pump::dispatch`] |
//! | Reply frames are written on a later pump turn than the handler call. | [`Pump::on_completed`] |
//! | An exited worker's pending transactions are dropped. | [`Pump::on_exit`] |
//! | Plugin close hooks fire for every exit. | [`Pump::on_exit`] |

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use shepherd_proto::{Invoke, PrimaryMessage, TransactionTracker, WorkerId, WorkerMessage};
use shepherd_runtime::{GenerationClock, TaskClass, panic_message, spawn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::command::{CommandError, CommandRegistry, Completion, Reply};
use crate::config::RelaunchConfig;
use crate::env::Environment;
use crate::launcher::{LaunchError, SlotEvents, WorkerExit, WorkerLauncher};
use crate::plugin::{PluginSet, WorkerKind};

/// Identity of one launch. Never reused, unlike OS process ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Continuation run when a worker reports `ONLINE`.
pub type OnlineFn = Box<dyn FnOnce(WorkerId) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
	Launching,
	Online,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
	pub slot: SlotId,
	pub pid: WorkerId,
	pub status: SlotStatus,
	/// Invocations awaiting a reply.
	pub pending: usize,
}

pub(crate) enum PoolEvent {
	Message { slot: SlotId, msg: WorkerMessage },
	Exited { slot: SlotId, exit: WorkerExit },
	Completed { slot: SlotId, completion: Completion },
	Relaunch { on_online: OnlineFn },
}

impl fmt::Debug for PoolEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Message { slot, msg } => f.debug_struct("Message").field("slot", slot).field("msg", msg).finish(),
			Self::Exited { slot, exit } => f.debug_struct("Exited").field("slot", slot).field("exit", exit).finish(),
			Self::Completed { slot, completion } => f
				.debug_struct("Completed")
				.field("slot", slot)
				.field("txid", &completion.txid)
				.finish(),
			Self::Relaunch { .. } => f.write_str("Relaunch"),
		}
	}
}

struct WorkerSlot {
	pid: WorkerId,
	status: SlotStatus,
	outbound: Option<mpsc::UnboundedSender<PrimaryMessage>>,
	kill: CancellationToken,
	on_online: Option<OnlineFn>,
	pending: TransactionTracker<()>,
}

impl WorkerSlot {
	fn send(&self, msg: PrimaryMessage) -> bool {
		self.outbound.as_ref().is_some_and(|tx| tx.send(msg).is_ok())
	}
}

struct PoolState {
	slots: BTreeMap<SlotId, WorkerSlot>,
	accepting: bool,
}

struct Shared {
	env: Environment,
	registry: Arc<CommandRegistry>,
	plugins: Arc<PluginSet>,
	launcher: Arc<dyn WorkerLauncher>,
	relaunch: RelaunchConfig,
	state: Mutex<PoolState>,
	events: mpsc::UnboundedSender<PoolEvent>,
	clock: GenerationClock,
	live: watch::Sender<usize>,
	cancel: CancellationToken,
}

/// Everything the supervisor needs from startup.
pub struct SupervisorParts {
	pub env: Environment,
	pub registry: Arc<CommandRegistry>,
	pub plugins: Arc<PluginSet>,
	pub launcher: Arc<dyn WorkerLauncher>,
	pub relaunch: RelaunchConfig,
}

/// Owns the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
	shared: Arc<Shared>,
}

impl Supervisor {
	/// Creates the supervisor and spawns its pump on the current runtime.
	pub fn start(parts: SupervisorParts) -> Self {
		let (events, rx) = mpsc::unbounded_channel();
		let (live, _) = watch::channel(0);
		let shared = Arc::new(Shared {
			env: parts.env,
			registry: parts.registry,
			plugins: parts.plugins,
			launcher: parts.launcher,
			relaunch: parts.relaunch,
			state: Mutex::new(PoolState {
				slots: BTreeMap::new(),
				accepting: true,
			}),
			events,
			clock: GenerationClock::new(),
			live,
			cancel: CancellationToken::new(),
		});
		spawn(TaskClass::Bus, "supervisor.pump", Pump { shared: Arc::clone(&shared) }.run(rx));
		Self { shared }
	}

	pub fn env(&self) -> &Environment {
		&self.shared.env
	}

	/// Handle that does not keep the pool alive.
	pub fn downgrade(&self) -> WeakSupervisor {
		WeakSupervisor {
			shared: Arc::downgrade(&self.shared),
		}
	}

	/// Launches one worker. `on_online` runs when it reports `ONLINE`.
	///
	/// # Errors
	///
	/// Returns the launcher's error, or [`LaunchError::ShuttingDown`].
	pub fn launch_worker(&self, on_online: OnlineFn) -> Result<WorkerId, LaunchError> {
		self.shared.launch(on_online)
	}

	/// Launches `count` workers and waits until every one of them is online.
	///
	/// Workers that crash before coming online are replaced, and the
	/// replacement completes the wait in their stead.
	///
	/// # Errors
	///
	/// Fails if a launch fails or the supervisor shuts down first.
	pub async fn launch_pool(&self, count: usize) -> Result<Vec<WorkerId>, LaunchError> {
		let mut waiting = Vec::with_capacity(count);
		for _ in 0..count {
			let (tx, rx) = oneshot::channel();
			self.launch_worker(Box::new(move |pid: WorkerId| {
				let _ = tx.send(pid);
			}))?;
			waiting.push(rx);
		}
		let mut online = Vec::with_capacity(count);
		for rx in waiting {
			online.push(rx.await.map_err(|_| LaunchError::Abandoned)?);
		}
		Ok(online)
	}

	/// Sends an event with a fresh transaction id to every online worker.
	///
	/// Returns the workers addressed. Delivery is best effort and unacknowledged.
	pub fn broadcast(&self, command: &str, payload: Value) -> Vec<WorkerId> {
		let state = self.shared.state.lock();
		let mut addressed = Vec::new();
		for slot in state.slots.values().filter(|s| s.status == SlotStatus::Online) {
			let msg = PrimaryMessage::Event {
				txid: slot.pending.next_id(),
				command: command.to_owned(),
				payload: payload.clone(),
			};
			if slot.send(msg) {
				addressed.push(slot.pid);
			}
		}
		tracing::trace!(command, workers = addressed.len(), "supervisor.broadcast");
		addressed
	}

	/// Current workers, oldest launch first.
	pub fn workers(&self) -> Vec<WorkerRecord> {
		self.shared
			.state
			.lock()
			.slots
			.iter()
			.map(|(id, slot)| WorkerRecord {
				slot: *id,
				pid: slot.pid,
				status: slot.status,
				pending: slot.pending.len(),
			})
			.collect()
	}

	/// Stops relaunching and closes every worker's input, then waits up to
	/// `timeout` for the pool to drain before killing the rest.
	///
	/// Returns the number of workers that had to be killed.
	pub async fn shutdown(&self, timeout: Duration) -> usize {
		{
			let mut state = self.shared.state.lock();
			state.accepting = false;
			for slot in state.slots.values_mut() {
				slot.outbound = None;
			}
			tracing::info!(workers = state.slots.len(), "supervisor.shutdown");
		}

		let mut live = self.shared.live.subscribe();
		let drained = tokio::time::timeout(timeout, live.wait_for(|n| *n == 0)).await.is_ok();
		let mut killed = 0;
		if !drained {
			for slot in self.shared.state.lock().slots.values() {
				tracing::warn!(pid = %slot.pid, "supervisor.shutdown.kill");
				slot.kill.cancel();
				killed += 1;
			}
			let _ = tokio::time::timeout(timeout, live.wait_for(|n| *n == 0)).await;
		}
		self.shared.cancel.cancel();
		killed
	}
}

/// Non-owning [`Supervisor`] handle, for callbacks stored inside the
/// supervisor's own environment.
#[derive(Clone)]
pub struct WeakSupervisor {
	shared: Weak<Shared>,
}

impl WeakSupervisor {
	/// Returns the supervisor if it has not been dropped.
	pub fn upgrade(&self) -> Option<Supervisor> {
		self.shared.upgrade().map(|shared| Supervisor { shared })
	}
}

impl fmt::Debug for WeakSupervisor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WeakSupervisor").field("alive", &(self.shared.strong_count() > 0)).finish()
	}
}

impl fmt::Debug for Supervisor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Supervisor").field("workers", &self.workers()).finish()
	}
}

impl Shared {
	fn launch(&self, on_online: OnlineFn) -> Result<WorkerId, LaunchError> {
		self.try_launch(on_online).map_err(|(error, _)| error)
	}

	/// Like [`Shared::launch`], but hands the continuation back on failure.
	fn try_launch(&self, on_online: OnlineFn) -> Result<WorkerId, (LaunchError, OnlineFn)> {
		let mut state = self.state.lock();
		if !state.accepting {
			return Err((LaunchError::ShuttingDown, on_online));
		}
		let slot = SlotId(self.clock.next());
		let snapshot = self.env.snapshot();
		let launched = match self.launcher.launch(&snapshot, SlotEvents::new(slot, self.events.clone())) {
			Ok(launched) => launched,
			Err(error) => return Err((error, on_online)),
		};
		tracing::info!(%slot, pid = %launched.pid, env_version = snapshot.version, "worker.spawn");
		state.slots.insert(
			slot,
			WorkerSlot {
				pid: launched.pid,
				status: SlotStatus::Launching,
				outbound: Some(launched.outbound),
				kill: launched.kill,
				on_online: Some(on_online),
				pending: TransactionTracker::new(),
			},
		);
		self.live.send_replace(state.slots.len());
		Ok(launched.pid)
	}

	/// Queues a relaunch after `delay`.
	fn relaunch_later(&self, delay: Duration, on_online: OnlineFn) {
		tracing::debug!(delay_ms = delay.as_millis() as u64, "worker.relaunch.delayed");
		let events = self.events.clone();
		spawn(TaskClass::Timer, "worker.relaunch.delay", async move {
			tokio::time::sleep(delay).await;
			let _ = events.send(PoolEvent::Relaunch { on_online });
		});
	}

	/// Launches a replacement seeded with a snapshot taken now. Failed
	/// launches are retried after the startup crash delay.
	fn relaunch(&self, on_online: OnlineFn) {
		match self.try_launch(on_online) {
			Ok(_) | Err((LaunchError::ShuttingDown, _)) => {}
			Err((error, on_online)) => {
				tracing::error!(%error, "worker.relaunch.failed");
				self.relaunch_later(self.relaunch.startup_crash_delay(), on_online);
			}
		}
	}
}

struct Pump {
	shared: Arc<Shared>,
}

impl Pump {
	async fn run(self, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
		loop {
			let event = tokio::select! {
				() = self.shared.cancel.cancelled() => break,
				event = rx.recv() => match event {
					Some(event) => event,
					None => break,
				},
			};
			tracing::trace!(?event, "supervisor.event");
			match event {
				PoolEvent::Message { slot, msg } => match msg {
					WorkerMessage::Online { pid } => self.on_online(slot, pid),
					WorkerMessage::Invoke(invoke) => self.dispatch(slot, invoke),
				},
				PoolEvent::Exited { slot, exit } => self.on_exit(slot, exit),
				PoolEvent::Completed { slot, completion } => self.on_completed(slot, completion),
				PoolEvent::Relaunch { on_online } => self.shared.relaunch(on_online),
			}
		}
		tracing::debug!("supervisor.pump.exit");
	}

	fn on_online(&self, slot: SlotId, reported: WorkerId) {
		let continuation = {
			let mut state = self.shared.state.lock();
			let Some(worker) = state.slots.get_mut(&slot) else {
				return;
			};
			if worker.status == SlotStatus::Online {
				tracing::debug!(%slot, "worker.online.duplicate");
				return;
			}
			if reported != worker.pid {
				tracing::debug!(%slot, pid = %worker.pid, %reported, "worker.online.pid_mismatch");
			}
			worker.status = SlotStatus::Online;
			tracing::debug!(%slot, pid = %worker.pid, "worker.online");
			worker.on_online.take().map(|f| (f, worker.pid))
		};
		if let Some((on_online, pid)) = continuation {
			on_online(pid);
		}
	}

	fn dispatch(&self, slot: SlotId, invoke: Invoke) {
		let Invoke { txid, pid, command, payload } = invoke;
		let Some(payload) = payload else {
			tracing::debug!(%slot, %txid, command = %command, "command.invoke.no_payload");
			return;
		};
		{
			let mut state = self.shared.state.lock();
			let Some(worker) = state.slots.get_mut(&slot) else {
				return;
			};
			if worker.pending.register(txid.clone(), ()).is_err() {
				tracing::warn!(%slot, %txid, command = %command, "command.invoke.duplicate");
				return;
			}
		}

		let events = self.shared.events.clone();
		let reply = Reply::new(txid.clone(), pid, move |completion| {
			let _ = events.send(PoolEvent::Completed { slot, completion });
		});

		let Some(handler) = self.shared.registry.lookup(&command).cloned() else {
			tracing::error!(%pid, %txid, command = %command, "UNHANDLED_HTTP_WORKER_COMMAND");
			reply.err(CommandError::Unhandled(command));
			return;
		};

		tracing::trace!(%pid, %txid, command = %command, "command.invoke");
		let guard = reply.clone();
		if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.call(payload, reply))) {
			let message = panic_message(&*panic);
			tracing::error!(%pid, %txid, command = %command, %message, "command.handler.panic");
			guard.err(CommandError::Panicked(message));
		}
	}

	fn on_completed(&self, slot: SlotId, completion: Completion) {
		let Completion { txid, pid, outcome } = completion;
		let mut state = self.shared.state.lock();
		let Some(worker) = state.slots.get_mut(&slot) else {
			tracing::debug!(%slot, %txid, "command.reply.orphaned");
			return;
		};
		if worker.pending.resolve(&txid).is_none() {
			return;
		}
		let (error, value) = match outcome {
			Ok(value) => (None, value),
			Err(err) => (Some(err.to_serialized()), None),
		};
		if !worker.send(PrimaryMessage::Reply { txid, pid, error, value }) {
			tracing::debug!(%slot, "command.reply.closed");
		}
	}

	fn on_exit(&self, slot: SlotId, exit: WorkerExit) {
		let (mut worker, accepting, remaining) = {
			let mut state = self.shared.state.lock();
			let Some(worker) = state.slots.remove(&slot) else {
				return;
			};
			let remaining = state.slots.len();
			(worker, state.accepting, remaining)
		};
		self.shared.live.send_replace(remaining);

		let abandoned = worker.pending.drain().count();
		if abandoned > 0 {
			tracing::debug!(%slot, pid = %worker.pid, abandoned, "worker.pending.dropped");
		}

		self.shared.plugins.worker_closed(WorkerKind::Http, worker.pid);

		if exit.is_clean() {
			tracing::info!(%slot, pid = %worker.pid, "worker.exit.clean");
			return;
		}
		tracing::error!(
			pid = %worker.pid,
			code = exit.code,
			signal = exit.signal_name(),
			"HTTP_WORKER_EXIT"
		);
		if !accepting {
			return;
		}

		match worker.on_online.take() {
			Some(pending) => self.shared.relaunch_later(self.shared.relaunch.startup_crash_delay(), pending),
			None => self.shared.relaunch(Box::new(|pid: WorkerId| {
				tracing::info!(%pid, "HTTP_WORKER_RELAUNCH");
			})),
		}
	}
}

#[cfg(test)]
mod tests;
