//! Primary-process worker supervisor and command bus.
//!
//! The primary launches a pool of worker processes, relaunches crashed ones
//! with a fresh [`EnvSnapshot`](shepherd_proto::EnvSnapshot), answers command
//! invocations from workers through a frozen [`CommandRegistry`], and pushes
//! throttled state-change events to every live worker.
//!
//! Start one with [`Primary::builder`].

pub mod broadcast;
pub mod command;
pub mod config;
pub mod env;
pub mod launcher;
pub mod plugin;
pub mod primary;
pub mod quota;
pub mod supervisor;

pub use broadcast::{BROADCAST_THROTTLE_WINDOW, EnvBroadcasts};
pub use command::{CommandError, CommandHandler, CommandRegistry, HandlerRef, Reply, async_handler, handler};
pub use config::{Config, ConfigError, RelaunchConfig};
pub use env::{Environment, Signal};
pub use launcher::{LaunchError, ProcessLauncher, WorkerExit, WorkerLauncher};
pub use plugin::{Phase, Plugin, PluginError, PluginSet, WorkerKind, isolate};
pub use primary::{Primary, PrimaryBuilder, StartError, WORKER_SUBCOMMAND};
pub use quota::{ConfigQuotaSource, QuotaError, QuotaSource};
pub use supervisor::{Supervisor, WeakSupervisor, WorkerRecord};
