//! Serializable projection of primary state handed to workers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Storage allowance granted to one account key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
	/// Allowance in bytes.
	pub limit: u64,
	/// Plan name the allowance belongs to.
	pub plan: String,
	/// Free-form note shown to administrators.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub note: Option<String>,
}

/// Read-only copy of the primary's environment.
///
/// Workers receive one at spawn time and a replacement with every
/// [`crate::ENV_UPDATE`] event. It is always a copy: workers cannot mutate
/// primary state except through a command round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
	/// Monotonic environment version; bumps on every primary-side mutation.
	pub version: u64,
	/// Cache freshness key; rotates on every cache flush.
	pub fresh_key: u64,
	/// Origin clients are expected to use.
	pub http_unsafe_origin: String,
	/// Address workers bind to.
	pub http_address: String,
	/// Main HTTP port.
	pub http_port: u16,
	/// Port for the sandboxed origin.
	pub http_safe_port: u16,
	/// Websocket port.
	pub websocket_port: u16,
	/// Whether the deployment runs without outbound network access.
	pub offline_mode: bool,
	/// Number of workers the pool was sized to.
	pub max_workers: usize,
	/// Cached quota limits by account key.
	#[serde(default)]
	pub limits: BTreeMap<String, QuotaLimit>,
}
