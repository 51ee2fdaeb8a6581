//! Optional extension hooks.
//!
//! A [`Plugin`] is a name plus any subset of three hooks. Every hook call goes
//! through [`isolate`], so a failing or panicking plugin is logged and skipped
//! without affecting the primary or the other plugins.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use shepherd_proto::WorkerId;
use shepherd_runtime::panic_message;
use thiserror::Error;

use crate::command::{HandlerRef, RegistryBuilder};
use crate::env::Environment;

/// Process role passed to [`Plugin::on_initialize`]. Plugins only run in the
/// primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Main,
}

impl Phase {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Main => "main",
		}
	}
}

/// Kind of worker reported to [`Plugin::on_worker_closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
	Http,
}

impl WorkerKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Http => "http-worker",
		}
	}
}

/// Error a plugin hook reports.
#[derive(Debug, Error)]
pub enum PluginError {
	#[error("{0}")]
	Failed(String),
	#[error("panicked: {0}")]
	Panicked(String),
}

impl PluginError {
	pub fn msg(message: impl Into<String>) -> Self {
		Self::Failed(message.into())
	}
}

/// Commands contributed by a plugin, in contribution order.
pub type Commands = Vec<(String, HandlerRef)>;

type InitHook = Box<dyn Fn(&Environment, Phase) -> Result<(), PluginError> + Send + Sync>;
type CommandsHook = Box<dyn Fn(&Environment) -> Result<Commands, PluginError> + Send + Sync>;
type ClosedHook = Box<dyn Fn(WorkerKind, WorkerId) -> Result<(), PluginError> + Send + Sync>;

/// A named bundle of optional hooks.
pub struct Plugin {
	name: String,
	initialize: Option<InitHook>,
	main_commands: Option<CommandsHook>,
	on_worker_closed: Option<ClosedHook>,
}

impl Plugin {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			initialize: None,
			main_commands: None,
			on_worker_closed: None,
		}
	}

	/// Runs once per process before any command is registered.
	#[must_use]
	pub fn on_initialize(
		mut self,
		hook: impl Fn(&Environment, Phase) -> Result<(), PluginError> + Send + Sync + 'static,
	) -> Self {
		self.initialize = Some(Box::new(hook));
		self
	}

	/// Contributes primary-side commands. Names already taken are ignored.
	#[must_use]
	pub fn with_main_commands(
		mut self,
		hook: impl Fn(&Environment) -> Result<Commands, PluginError> + Send + Sync + 'static,
	) -> Self {
		self.main_commands = Some(Box::new(hook));
		self
	}

	/// Observes every worker exit, clean or not.
	#[must_use]
	pub fn on_worker_closed(
		mut self,
		hook: impl Fn(WorkerKind, WorkerId) -> Result<(), PluginError> + Send + Sync + 'static,
	) -> Self {
		self.on_worker_closed = Some(Box::new(hook));
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

impl fmt::Debug for Plugin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Plugin")
			.field("name", &self.name)
			.field("initialize", &self.initialize.is_some())
			.field("main_commands", &self.main_commands.is_some())
			.field("on_worker_closed", &self.on_worker_closed.is_some())
			.finish()
	}
}

/// Runs one hook, converting errors and panics into a log record.
///
/// Returns `None` when the hook failed.
pub fn isolate<T>(plugin: &str, hook: &'static str, f: impl FnOnce() -> Result<T, PluginError>) -> Option<T> {
	let result = match catch_unwind(AssertUnwindSafe(f)) {
		Ok(result) => result,
		Err(payload) => Err(PluginError::Panicked(panic_message(&*payload))),
	};
	match result {
		Ok(value) => Some(value),
		Err(error) => {
			tracing::warn!(plugin, hook, %error, "PLUGIN_HOOK_FAILED");
			None
		}
	}
}

/// Plugins in registration order.
#[derive(Debug, Default)]
pub struct PluginSet {
	plugins: Vec<Plugin>,
}

impl PluginSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, plugin: Plugin) {
		self.plugins.push(plugin);
	}

	pub fn len(&self) -> usize {
		self.plugins.len()
	}

	pub fn is_empty(&self) -> bool {
		self.plugins.is_empty()
	}

	pub fn initialize(&self, env: &Environment, phase: Phase) {
		for plugin in &self.plugins {
			if let Some(hook) = &plugin.initialize {
				tracing::debug!(plugin = %plugin.name, phase = phase.as_str(), "plugin.initialize");
				isolate(&plugin.name, "initialize", || hook(env, phase));
			}
		}
	}

	/// Adds every plugin's commands to `builder`.
	///
	/// A plugin whose hook fails contributes nothing.
	pub fn contribute_commands(&self, env: &Environment, builder: &mut RegistryBuilder) {
		for plugin in &self.plugins {
			let Some(hook) = &plugin.main_commands else {
				continue;
			};
			let Some(commands) = isolate(&plugin.name, "main_commands", || hook(env)) else {
				continue;
			};
			for (name, handler) in commands {
				builder.register_from(&plugin.name, name, handler);
			}
		}
	}

	pub fn worker_closed(&self, kind: WorkerKind, pid: WorkerId) {
		for plugin in &self.plugins {
			if let Some(hook) = &plugin.on_worker_closed {
				isolate(&plugin.name, "on_worker_closed", || hook(kind, pid));
			}
		}
	}
}

impl FromIterator<Plugin> for PluginSet {
	fn from_iter<I: IntoIterator<Item = Plugin>>(iter: I) -> Self {
		Self {
			plugins: iter.into_iter().collect(),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use serde_json::{Value, json};

	use super::*;
	use crate::command::{Reply, handler};
	use crate::config::Config;

	fn env() -> Environment {
		let config = Config {
			http_unsafe_origin: "http://localhost".to_owned(),
			..Config::default()
		};
		Environment::new(&config, 1)
	}

	fn constant(n: u64) -> HandlerRef {
		handler(move |_: Value, reply: Reply| {
			reply.ok(json!(n));
		})
	}

	#[test]
	fn isolate_swallows_errors_and_panics() {
		assert_eq!(isolate("p", "hook", || Ok(3)), Some(3));
		assert_eq!(isolate::<()>("p", "hook", || Err(PluginError::msg("nope"))), None);
		assert_eq!(isolate::<()>("p", "hook", || panic!("kaboom")), None);
	}

	#[test]
	fn failing_plugin_does_not_stop_the_others() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let s = Arc::clone(&seen);
		let set: PluginSet = [
			Plugin::new("broken").on_worker_closed(|_, _| panic!("bad plugin")),
			Plugin::new("audit").on_worker_closed(move |kind, pid| {
				s.lock().unwrap().push((kind.as_str(), pid));
				Ok(())
			}),
		]
		.into_iter()
		.collect();

		set.worker_closed(WorkerKind::Http, WorkerId(77));
		assert_eq!(*seen.lock().unwrap(), vec![("http-worker", WorkerId(77))]);
	}

	#[test]
	fn initialize_receives_main_phase() {
		let phases = Arc::new(Mutex::new(Vec::new()));
		let p = Arc::clone(&phases);
		let set: PluginSet = [Plugin::new("a").on_initialize(move |_, phase| {
			p.lock().unwrap().push(phase);
			Ok(())
		})]
		.into_iter()
		.collect();

		set.initialize(&env(), Phase::Main);
		assert_eq!(*phases.lock().unwrap(), vec![Phase::Main]);
	}

	#[test]
	fn commands_merge_in_plugin_order_without_override() {
		let env = env();
		let set: PluginSet = [
			Plugin::new("first").with_main_commands(|_| Ok(vec![("EXTRA".to_owned(), constant(1))])),
			Plugin::new("failing").with_main_commands(|_| Err(PluginError::msg("no commands today"))),
			Plugin::new("second").with_main_commands(|_| {
				Ok(vec![
					("EXTRA".to_owned(), constant(2)),
					("lower".to_owned(), constant(3)),
					("OTHER".to_owned(), constant(4)),
				])
			}),
		]
		.into_iter()
		.collect();

		let mut builder = RegistryBuilder::new();
		set.contribute_commands(&env, &mut builder);
		let registry = builder.build();

		assert_eq!(registry.names(), vec!["EXTRA", "OTHER"]);
		assert_eq!(registry.source("EXTRA"), Some("first"));
		assert_eq!(registry.source("OTHER"), Some("second"));
	}
}
