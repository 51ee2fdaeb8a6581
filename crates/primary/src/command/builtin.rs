use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{CommandError, RegistryBuilder, Reply, async_handler, handler};
use crate::env::Environment;
use crate::quota::QuotaSource;

/// Log a record on behalf of a worker.
pub const LOG: &str = "LOG";
/// Refresh cached quota limits.
pub const UPDATE_QUOTA: &str = "UPDATE_QUOTA";
/// Read the primary's outbound byte counter.
pub const GET_PROFILING_DATA: &str = "GET_PROFILING_DATA";

/// Registers the built-in commands. Must run before any plugin contributes.
pub fn register_builtins(builder: &mut RegistryBuilder, env: &Environment, quota: Arc<dyn QuotaSource>) {
	builder.register(LOG, handler(log));

	let quota_env = env.clone();
	builder.register(
		UPDATE_QUOTA,
		async_handler(move |_payload| {
			let env = quota_env.clone();
			let quota = Arc::clone(&quota);
			async move {
				if let Err(err) = quota.refresh(&env).await {
					tracing::warn!(error = %err, "UPDATE_QUOTA_ERR");
					return Err(CommandError::from(err));
				}
				tracing::info!("QUOTA_UPDATED");
				Ok(None)
			}
		}),
	);

	let profiling_env = env.clone();
	builder.register(
		GET_PROFILING_DATA,
		handler(move |_payload, reply: Reply| {
			reply.ok(json!(profiling_env.bytes_written()));
		}),
	);
}

#[derive(Debug, Deserialize)]
struct LogRecord {
	#[serde(default)]
	level: String,
	#[serde(default)]
	tag: String,
	#[serde(default)]
	info: Value,
}

fn log(payload: Value, reply: Reply) {
	let record = match serde_json::from_value::<LogRecord>(payload) {
		Ok(record) => record,
		Err(err) => {
			tracing::warn!(error = %err, "worker.log.malformed");
			reply.done();
			return;
		}
	};
	let LogRecord { level, tag, info } = record;
	match level.as_str() {
		"silly" | "verbose" | "trace" => tracing::trace!(tag = %tag, info = %info, "worker.log"),
		"debug" => tracing::debug!(tag = %tag, info = %info, "worker.log"),
		"info" => tracing::info!(tag = %tag, info = %info, "worker.log"),
		"warn" => tracing::warn!(tag = %tag, info = %info, "worker.log"),
		"error" => tracing::error!(tag = %tag, info = %info, "worker.log"),
		other => tracing::info!(level = other, tag = %tag, info = %info, "worker.log"),
	}
	reply.done();
}
