use std::collections::HashMap;
use std::fmt;

use shepherd_proto::is_command_name;

use super::HandlerRef;

/// Where a handler came from.
const BUILTIN: &str = "builtin";

struct Entry {
	handler: HandlerRef,
	source: String,
}

/// Mutable registry used during startup.
///
/// The first registration for a name wins. Names that are not upper-case
/// tokens are rejected. Rejections are silent to the caller and traced at
/// debug level.
#[derive(Default)]
pub struct RegistryBuilder {
	entries: HashMap<String, Entry>,
}

impl RegistryBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a built-in handler. Returns whether it was accepted.
	pub fn register(&mut self, name: impl Into<String>, handler: HandlerRef) -> bool {
		self.register_from(BUILTIN, name, handler)
	}

	/// Registers a handler contributed by `source`. Returns whether it was accepted.
	pub fn register_from(&mut self, source: &str, name: impl Into<String>, handler: HandlerRef) -> bool {
		let name = name.into();
		if !is_command_name(&name) {
			tracing::debug!(command = %name, source, reason = "name", "command.register.rejected");
			return false;
		}
		if let Some(existing) = self.entries.get(&name) {
			tracing::debug!(
				command = %name,
				source,
				owner = %existing.source,
				reason = "duplicate",
				"command.register.rejected"
			);
			return false;
		}
		tracing::trace!(command = %name, source, "command.register");
		self.entries.insert(name, Entry { handler, source: source.to_owned() });
		true
	}

	/// Freezes the registry.
	pub fn build(self) -> CommandRegistry {
		CommandRegistry { entries: self.entries }
	}
}

/// Immutable name → handler table.
pub struct CommandRegistry {
	entries: HashMap<String, Entry>,
}

impl CommandRegistry {
	/// Returns the handler registered under `name`. Lookup is case-sensitive.
	pub fn lookup(&self, name: &str) -> Option<&HandlerRef> {
		self.entries.get(name).map(|e| &e.handler)
	}

	/// Returns the plugin name (or `"builtin"`) that contributed `name`.
	pub fn source(&self, name: &str) -> Option<&str> {
		self.entries.get(name).map(|e| e.source.as_str())
	}

	/// Registered names, sorted.
	pub fn names(&self) -> Vec<&str> {
		let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl fmt::Debug for CommandRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CommandRegistry").field("names", &self.names()).finish()
	}
}
