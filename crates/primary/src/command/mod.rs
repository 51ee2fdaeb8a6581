//! Primary-side command handlers invoked by workers.
//!
//! A handler receives the invoke payload and a [`Reply`]. It must eventually
//! send exactly one outcome through the reply, either inline or from a spawned
//! task. The registry is frozen before the first worker launches.

mod builtin;
mod error;
mod registry;
mod reply;

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use shepherd_runtime::{TaskClass, join_error_panic_message, spawn};

pub use builtin::{GET_PROFILING_DATA, LOG, UPDATE_QUOTA, register_builtins};
pub use error::CommandError;
pub use registry::{CommandRegistry, RegistryBuilder};
pub use reply::{Completion, Reply};

/// Result every handler eventually delivers.
pub type Outcome = Result<Option<Value>, CommandError>;

/// A command implementation.
pub trait CommandHandler: Send + Sync + 'static {
	/// Starts handling one invocation.
	fn call(&self, payload: Value, reply: Reply);
}

impl<F> CommandHandler for F
where
	F: Fn(Value, Reply) + Send + Sync + 'static,
{
	fn call(&self, payload: Value, reply: Reply) {
		self(payload, reply);
	}
}

/// Shared handler reference stored in the registry.
pub type HandlerRef = Arc<dyn CommandHandler>;

/// Wraps a synchronous closure.
pub fn handler(f: impl Fn(Value, Reply) + Send + Sync + 'static) -> HandlerRef {
	Arc::new(f)
}

/// Wraps an async function. Each call runs on its own task; a panic inside the
/// future is reported to the worker as [`CommandError::Panicked`].
pub fn async_handler<F, Fut>(f: F) -> HandlerRef
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Outcome> + Send + 'static,
{
	Arc::new(move |payload: Value, reply: Reply| {
		let work = spawn(TaskClass::Handler, "command.async", f(payload));
		spawn(TaskClass::Handler, "command.async.join", async move {
			let outcome = match work.await {
				Ok(outcome) => outcome,
				Err(err) => Err(CommandError::Panicked(
					join_error_panic_message(err).unwrap_or_else(|| "cancelled".to_owned()),
				)),
			};
			reply.send(outcome);
		});
	})
}
