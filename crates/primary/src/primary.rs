//! Startup orchestration.
//!
//! Order: validate configuration, build the environment, initialize plugins,
//! freeze the command registry, start the supervisor, wire broadcasts, then
//! launch the pool and wait for every worker to come online.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::broadcast::EnvBroadcasts;
use crate::command::{CommandRegistry, RegistryBuilder, register_builtins};
use crate::config::{Config, ConfigError};
use crate::env::Environment;
use crate::launcher::{LaunchError, ProcessLauncher, WorkerLauncher};
use crate::plugin::{Phase, Plugin, PluginSet};
use crate::quota::{ConfigQuotaSource, QuotaSource};
use crate::supervisor::{Supervisor, SupervisorParts};

/// Subcommand the worker binary is re-executed with.
pub const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Debug, Error)]
pub enum StartError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Launch(#[from] LaunchError),
}

/// Configures and starts a [`Primary`].
pub struct PrimaryBuilder {
	config: Config,
	config_path: PathBuf,
	plugins: PluginSet,
	launcher: Option<Arc<dyn WorkerLauncher>>,
	quota: Option<Arc<dyn QuotaSource>>,
	available: Option<usize>,
}

impl PrimaryBuilder {
	/// Path the default quota source re-reads limits from.
	#[must_use]
	pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config_path = path.into();
		self
	}

	#[must_use]
	pub fn plugin(mut self, plugin: Plugin) -> Self {
		self.plugins.push(plugin);
		self
	}

	/// Replaces the process launcher.
	#[must_use]
	pub fn launcher(mut self, launcher: impl WorkerLauncher) -> Self {
		self.launcher = Some(Arc::new(launcher));
		self
	}

	/// Replaces the quota source behind `UPDATE_QUOTA`.
	#[must_use]
	pub fn quota_source(mut self, quota: impl QuotaSource) -> Self {
		self.quota = Some(Arc::new(quota));
		self
	}

	/// Overrides the detected number of processing units.
	#[must_use]
	pub fn available_parallelism(mut self, units: usize) -> Self {
		self.available = Some(units);
		self
	}

	/// Runs startup and returns once every initial worker is online.
	///
	/// # Errors
	///
	/// Configuration errors are returned before any worker is launched.
	pub async fn start(self) -> Result<Primary, StartError> {
		let origin = self.config.validate()?;
		let available = self
			.available
			.unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));
		let count = self.config.worker_count(available);
		let env = Environment::new(&self.config, count);

		let plugins = Arc::new(self.plugins);
		plugins.initialize(&env, Phase::Main);

		let quota = self
			.quota
			.unwrap_or_else(|| Arc::new(ConfigQuotaSource::new(self.config_path.clone())));
		let mut builder = RegistryBuilder::new();
		register_builtins(&mut builder, &env, quota);
		plugins.contribute_commands(&env, &mut builder);
		let registry = Arc::new(builder.build());
		tracing::debug!(commands = ?registry.names(), "command.registry");

		let launcher = match self.launcher {
			Some(launcher) => launcher,
			None => Arc::new(process_launcher(&self.config, env.clone())?),
		};

		tracing::info!(origin = %origin, "PRIMARY_ORIGIN");
		let supervisor = Supervisor::start(SupervisorParts {
			env: env.clone(),
			registry: Arc::clone(&registry),
			plugins,
			launcher,
			relaunch: self.config.relaunch.clone(),
		});
		let broadcasts = EnvBroadcasts::install(&supervisor);

		let pids = supervisor.launch_pool(count).await?;
		tracing::info!(workers = pids.len(), "WORKERS_ONLINE");

		Ok(Primary {
			origin,
			env,
			registry,
			supervisor,
			broadcasts,
		})
	}
}

fn process_launcher(config: &Config, env: Environment) -> Result<ProcessLauncher, LaunchError> {
	let launcher = match &config.worker_program {
		Some(program) => ProcessLauncher::new(program.clone(), env),
		None => ProcessLauncher::current_exe(env)?,
	};
	Ok(launcher.arg(WORKER_SUBCOMMAND))
}

/// A running primary.
pub struct Primary {
	origin: Url,
	env: Environment,
	registry: Arc<CommandRegistry>,
	supervisor: Supervisor,
	broadcasts: EnvBroadcasts,
}

impl Primary {
	pub fn builder(config: Config) -> PrimaryBuilder {
		PrimaryBuilder {
			config,
			config_path: PathBuf::from("shepherd.toml"),
			plugins: PluginSet::new(),
			launcher: None,
			quota: None,
			available: None,
		}
	}

	pub fn origin(&self) -> &Url {
		&self.origin
	}

	pub fn env(&self) -> &Environment {
		&self.env
	}

	pub fn registry(&self) -> &CommandRegistry {
		&self.registry
	}

	pub fn supervisor(&self) -> &Supervisor {
		&self.supervisor
	}

	pub fn broadcasts(&self) -> &EnvBroadcasts {
		&self.broadcasts
	}

	/// Closes worker channels, waits up to `timeout`, then kills the rest.
	pub async fn shutdown(self, timeout: Duration) -> usize {
		self.supervisor.shutdown(timeout).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use parking_lot::Mutex;
	use serde_json::{Value, json};

	use super::*;
	use crate::command::{Reply, handler};
	use crate::launcher::test_helpers::TestLauncher;

	fn config(origin: &str) -> Config {
		Config {
			http_unsafe_origin: origin.to_owned(),
			max_workers: 2,
			..Config::default()
		}
	}

	#[tokio::test(start_paused = true)]
	async fn starts_pool_sized_by_config_and_cores() {
		let launcher = TestLauncher::new();
		let primary = Primary::builder(config("https://pad.example.org"))
			.launcher(launcher.clone())
			.available_parallelism(8)
			.start()
			.await
			.unwrap();

		assert_eq!(launcher.launches(), 2);
		assert_eq!(primary.supervisor().workers().len(), 2);
		assert_eq!(primary.env().snapshot().max_workers, 2);
		assert_eq!(primary.origin().as_str(), "https://pad.example.org/");
		assert_eq!(launcher.worker(0).snapshot.http_unsafe_origin, "https://pad.example.org");
	}

	#[tokio::test(start_paused = true)]
	async fn invalid_origin_launches_nothing() {
		let launcher = TestLauncher::new();
		for origin in ["", "not a url"] {
			let err = Primary::builder(config(origin))
				.launcher(launcher.clone())
				.start()
				.await
				.err()
				.unwrap();
			assert!(matches!(err, StartError::Config(_)));
		}
		assert_eq!(launcher.launches(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn plugins_initialize_before_contributing_commands() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let (a, b) = (Arc::clone(&order), Arc::clone(&order));
		let plugin = Plugin::new("extras")
			.on_initialize(move |_, phase| {
				a.lock().push(format!("init:{}", phase.as_str()));
				Ok(())
			})
			.with_main_commands(move |_| {
				b.lock().push("commands".to_owned());
				Ok(vec![
					("PING".to_owned(), handler(|_: Value, reply: Reply| {
						reply.ok(json!("pong"));
					})),
					("LOG".to_owned(), handler(|_: Value, reply: Reply| {
						reply.ok(json!("hijacked"));
					})),
				])
			});

		let primary = Primary::builder(config("http://localhost:3000"))
			.plugin(plugin)
			.launcher(TestLauncher::new())
			.available_parallelism(1)
			.start()
			.await
			.unwrap();

		assert_eq!(*order.lock(), vec!["init:main".to_owned(), "commands".to_owned()]);
		assert_eq!(primary.registry().source("PING"), Some("extras"));
		assert_eq!(primary.registry().source("LOG"), Some("builtin"));
	}

	#[tokio::test(start_paused = true)]
	async fn closed_hook_sees_every_exit() {
		let closed = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&closed);
		let launcher = TestLauncher::new();
		let primary = Primary::builder(config("http://localhost:3000"))
			.plugin(Plugin::new("count").on_worker_closed(move |_, _| {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}))
			.launcher(launcher.clone())
			.available_parallelism(2)
			.start()
			.await
			.unwrap();

		let killed = primary.shutdown(Duration::from_secs(1)).await;
		assert_eq!(killed, 0);
		assert_eq!(closed.load(Ordering::SeqCst), 2);
	}
}
