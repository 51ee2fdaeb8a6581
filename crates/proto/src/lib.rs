//! Shared wire types for the shepherd command bus.
//!
//! The primary and each worker exchange newline-delimited JSON frames over the
//! worker's stdio pipes. Workers send [`WorkerMessage`]s; the primary answers
//! with [`PrimaryMessage`]s. Every invoke is correlated with exactly one reply
//! by its [`TransactionId`]; events carry a fresh id and expect no reply.

#![warn(missing_docs)]

pub mod codec;
pub mod command;
pub mod error;
pub mod snapshot;
pub mod txn;
pub mod types;

pub use codec::{read_message, write_message};
pub use command::is_command_name;
pub use error::ProtoError;
pub use snapshot::{EnvSnapshot, QuotaLimit};
pub use txn::{DuplicateTransaction, TransactionTracker};
pub use types::*;

/// Environment variable carrying the serialized [`EnvSnapshot`] into a worker at spawn time.
pub const WORKER_ENV_VAR: &str = "SHEPHERD_WORKER_ENV";

/// Event command pushing a fresh [`EnvSnapshot`] to every worker.
pub const ENV_UPDATE: &str = "ENV_UPDATE";

/// Event command instructing workers to drop caches keyed by the previous fresh key.
pub const FLUSH_CACHE: &str = "FLUSH_CACHE";
