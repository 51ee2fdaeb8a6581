//! Worker launcher abstraction for production and testing.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use shepherd_proto::{
	EnvSnapshot, PrimaryMessage, WORKER_ENV_VAR, WorkerId, WorkerMessage, read_message, write_message,
};
use shepherd_runtime::{TaskClass, spawn};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::env::Environment;
use crate::supervisor::{PoolEvent, SlotId};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl WorkerExit {
	/// Exit code 0.
	pub const fn success() -> Self {
		Self::code(0)
	}

	pub const fn code(code: i32) -> Self {
		Self { code: Some(code), signal: None }
	}

	pub const fn signal(signal: i32) -> Self {
		Self { code: None, signal: Some(signal) }
	}

	/// Code 0 and no signal. Only clean exits are not relaunched.
	pub fn is_clean(&self) -> bool {
		self.signal.is_none() && self.code == Some(0)
	}

	/// Symbolic signal name, e.g. `SIGKILL`.
	pub fn signal_name(&self) -> Option<&'static str> {
		self.signal.and_then(signal_name)
	}
}

impl From<ExitStatus> for WorkerExit {
	fn from(status: ExitStatus) -> Self {
		#[cfg(unix)]
		let signal = std::os::unix::process::ExitStatusExt::signal(&status);
		#[cfg(not(unix))]
		let signal = None;
		Self { code: status.code(), signal }
	}
}

#[cfg(unix)]
fn signal_name(signo: i32) -> Option<&'static str> {
	nix::sys::signal::Signal::try_from(signo).ok().map(|s| s.as_str())
}

#[cfg(not(unix))]
fn signal_name(_signo: i32) -> Option<&'static str> {
	None
}

/// Delivery channel from one launched worker back to the supervisor.
#[derive(Debug, Clone)]
pub struct SlotEvents {
	slot: SlotId,
	tx: mpsc::UnboundedSender<PoolEvent>,
}

impl SlotEvents {
	pub(crate) fn new(slot: SlotId, tx: mpsc::UnboundedSender<PoolEvent>) -> Self {
		Self { slot, tx }
	}

	pub fn slot(&self) -> SlotId {
		self.slot
	}

	/// Forwards a frame read from the worker.
	pub fn message(&self, msg: WorkerMessage) {
		let _ = self.tx.send(PoolEvent::Message { slot: self.slot, msg });
	}

	/// Reports process termination. Must be the last event for the slot.
	pub fn exited(&self, exit: WorkerExit) {
		let _ = self.tx.send(PoolEvent::Exited { slot: self.slot, exit });
	}
}

/// Handles the supervisor keeps for one launched worker.
#[derive(Debug)]
pub struct LaunchedWorker {
	pub pid: WorkerId,
	/// Frames to write to the worker. Dropping every sender closes the worker's input.
	pub outbound: mpsc::UnboundedSender<PrimaryMessage>,
	/// Cancel to force-kill the process.
	pub kill: CancellationToken,
}

#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("failed to spawn worker {program}: {source}")]
	Spawn { program: PathBuf, source: std::io::Error },
	#[error("cannot locate the worker executable: {0}")]
	CurrentExe(#[source] std::io::Error),
	#[error("failed to serialize environment snapshot: {0}")]
	Snapshot(#[source] serde_json::Error),
	#[error("worker exited before reporting a pid")]
	MissingPid,
	#[error("worker {0} pipe unavailable")]
	Pipe(&'static str),
	#[error("supervisor is shutting down")]
	ShuttingDown,
	#[error("worker was abandoned before coming online")]
	Abandoned,
}

/// Starts worker processes.
///
/// `launch` is synchronous and runs while the supervisor holds its pool lock,
/// so no event from the new worker is handled before its slot exists.
pub trait WorkerLauncher: Send + Sync + 'static {
	/// Starts one worker seeded with `snapshot`. Messages and the final exit
	/// must be reported through `events`.
	fn launch(&self, snapshot: &EnvSnapshot, events: SlotEvents) -> Result<LaunchedWorker, LaunchError>;
}

/// Production launcher that re-executes a worker binary with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	program: PathBuf,
	args: Vec<OsString>,
	env: Environment,
}

impl ProcessLauncher {
	/// Launches `program`; bytes written to workers are added to `env`'s counter.
	pub fn new(program: impl Into<PathBuf>, env: Environment) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env,
		}
	}

	/// Launches the running executable.
	pub fn current_exe(env: Environment) -> Result<Self, LaunchError> {
		let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
		Ok(Self::new(program, env))
	}

	#[must_use]
	pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn program(&self) -> &PathBuf {
		&self.program
	}
}

impl WorkerLauncher for ProcessLauncher {
	fn launch(&self, snapshot: &EnvSnapshot, events: SlotEvents) -> Result<LaunchedWorker, LaunchError> {
		let state = serde_json::to_string(snapshot).map_err(LaunchError::Snapshot)?;
		let mut child = Command::new(&self.program)
			.args(&self.args)
			.env(WORKER_ENV_VAR, state)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| LaunchError::Spawn {
				program: self.program.clone(),
				source,
			})?;

		let pid = WorkerId(child.id().ok_or(LaunchError::MissingPid)?);
		let stdin = child.stdin.take().ok_or(LaunchError::Pipe("stdin"))?;
		let stdout = child.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;

		let (outbound, rx) = mpsc::unbounded_channel();
		let kill = CancellationToken::new();

		spawn(TaskClass::Io, "worker.writer", write_loop(stdin, rx, self.env.clone(), pid));
		let reader = spawn(TaskClass::Io, "worker.reader", read_loop(stdout, events.clone(), pid));

		let token = kill.clone();
		spawn(TaskClass::Io, "worker.wait", async move {
			let status = tokio::select! {
				status = child.wait() => status,
				() = token.cancelled() => {
					tracing::debug!(%pid, "worker.kill");
					let _ = child.start_kill();
					child.wait().await
				}
			};
			let exit = match status {
				Ok(status) => WorkerExit::from(status),
				Err(error) => {
					tracing::warn!(%pid, %error, "worker.wait.failed");
					WorkerExit { code: None, signal: None }
				}
			};
			// Frames the worker wrote before dying are handled before its exit.
			let _ = reader.await;
			events.exited(exit);
		});

		Ok(LaunchedWorker { pid, outbound, kill })
	}
}

async fn write_loop(
	mut stdin: ChildStdin,
	mut rx: mpsc::UnboundedReceiver<PrimaryMessage>,
	env: Environment,
	pid: WorkerId,
) {
	while let Some(msg) = rx.recv().await {
		match write_message(&mut stdin, &msg).await {
			Ok(n) => env.record_bytes_written(n as u64),
			Err(error) => {
				tracing::warn!(%pid, %error, "worker.write.failed");
				break;
			}
		}
	}
	tracing::trace!(%pid, "worker.writer.closed");
}

async fn read_loop(stdout: ChildStdout, events: SlotEvents, pid: WorkerId) {
	let mut reader = BufReader::new(stdout);
	loop {
		match read_message::<WorkerMessage>(&mut reader).await {
			Ok(Some(msg)) => events.message(msg),
			Ok(None) => break,
			Err(error) if error.is_recoverable() => {
				tracing::warn!(%pid, %error, "worker.decode.failed");
			}
			Err(error) => {
				tracing::warn!(%pid, %error, "worker.read.failed");
				break;
			}
		}
	}
	tracing::trace!(%pid, "worker.reader.closed");
}

/// In-process launcher for exercising the supervisor without child processes.
#[doc(hidden)]
pub mod test_helpers {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};

	use parking_lot::Mutex;

	use super::*;

	/// Test-side end of one fake worker.
	#[derive(Debug)]
	pub struct FakeWorker {
		pub pid: WorkerId,
		/// Snapshot the worker was seeded with.
		pub snapshot: EnvSnapshot,
		events: SlotEvents,
		inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<PrimaryMessage>>,
		exited: AtomicBool,
	}

	impl FakeWorker {
		/// Sends a frame to the primary as if the worker wrote it.
		pub fn send(&self, msg: WorkerMessage) {
			self.events.message(msg);
		}

		pub fn online(&self) {
			self.send(WorkerMessage::Online { pid: self.pid });
		}

		/// Next frame the primary wrote, or `None` once the channel is closed.
		pub async fn recv(&self) -> Option<PrimaryMessage> {
			self.inbox.lock().await.recv().await
		}

		/// Frame already delivered, without waiting.
		pub fn try_recv(&self) -> Option<PrimaryMessage> {
			self.inbox.try_lock().ok()?.try_recv().ok()
		}

		/// Terminates the fake process. Only the first call is reported.
		pub fn exit(&self, exit: WorkerExit) {
			if !self.exited.swap(true, Ordering::AcqRel) {
				self.events.exited(exit);
			}
		}

		pub fn has_exited(&self) -> bool {
			self.exited.load(Ordering::Acquire)
		}
	}

	#[derive(Debug, Default)]
	struct LauncherState {
		next_pid: u32,
		workers: Vec<Arc<FakeWorker>>,
		fail_next: usize,
	}

	/// Launcher producing [`FakeWorker`]s.
	///
	/// Fake workers exit 0 when their input closes unless built with
	/// [`TestLauncher::ignore_close`], and report `SIGKILL` when killed.
	#[derive(Debug, Clone)]
	pub struct TestLauncher {
		state: Arc<Mutex<LauncherState>>,
		auto_online: bool,
		exit_on_close: bool,
	}

	impl Default for TestLauncher {
		fn default() -> Self {
			Self::new()
		}
	}

	impl TestLauncher {
		/// Workers come online as soon as they launch.
		pub fn new() -> Self {
			Self {
				state: Arc::new(Mutex::new(LauncherState {
					next_pid: 1000,
					..LauncherState::default()
				})),
				auto_online: true,
				exit_on_close: true,
			}
		}

		/// Workers wait for [`FakeWorker::online`].
		#[must_use]
		pub fn manual_online(mut self) -> Self {
			self.auto_online = false;
			self
		}

		/// Workers keep running after their input closes.
		#[must_use]
		pub fn ignore_close(mut self) -> Self {
			self.exit_on_close = false;
			self
		}

		/// Makes the next `n` launches fail.
		pub fn fail_next(&self, n: usize) {
			self.state.lock().fail_next = n;
		}

		/// Every worker launched so far, oldest first.
		pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
			self.state.lock().workers.clone()
		}

		pub fn worker(&self, index: usize) -> Arc<FakeWorker> {
			Arc::clone(&self.state.lock().workers[index])
		}

		pub fn launches(&self) -> usize {
			self.state.lock().workers.len()
		}
	}

	impl WorkerLauncher for TestLauncher {
		fn launch(&self, snapshot: &EnvSnapshot, events: SlotEvents) -> Result<LaunchedWorker, LaunchError> {
			let mut state = self.state.lock();
			if state.fail_next > 0 {
				state.fail_next -= 1;
				return Err(LaunchError::Spawn {
					program: PathBuf::from("fake-worker"),
					source: std::io::Error::other("injected launch failure"),
				});
			}
			state.next_pid += 1;
			let pid = WorkerId(state.next_pid);

			let (outbound, mut rx) = mpsc::unbounded_channel();
			let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
			let kill = CancellationToken::new();
			let worker = Arc::new(FakeWorker {
				pid,
				snapshot: snapshot.clone(),
				events,
				inbox: tokio::sync::Mutex::new(inbox_rx),
				exited: AtomicBool::new(false),
			});
			state.workers.push(Arc::clone(&worker));

			let token = kill.clone();
			let exit_on_close = self.exit_on_close;
			let fake = Arc::clone(&worker);
			spawn(TaskClass::Io, "fake.worker", async move {
				loop {
					tokio::select! {
						msg = rx.recv() => match msg {
							Some(msg) => {
								let _ = inbox_tx.send(msg);
							}
							None => {
								if exit_on_close {
									fake.exit(WorkerExit::success());
								}
								drop(inbox_tx);
								token.cancelled().await;
								fake.exit(WorkerExit::signal(9));
								return;
							}
						},
						() = token.cancelled() => {
							fake.exit(WorkerExit::signal(9));
							return;
						}
					}
				}
			});

			if self.auto_online {
				worker.online();
			}
			Ok(LaunchedWorker { pid, outbound, kill })
		}
	}
}
