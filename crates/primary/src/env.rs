//! Versioned primary state and the signals fired when it changes.
//!
//! [`Environment`] is the only owner of mutable primary state. Workers never
//! see it directly: they receive [`EnvSnapshot`] copies at spawn time and on
//! every `ENV_UPDATE` broadcast.
//!
//! # Invariants
//!
//! | Invariant | Enforced in |
//! |---|---|
//! | `version` strictly increases on every setter call. | [`Environment::set_limits`], [`Environment::set_offline_mode`] |
//! | `fresh_key` changes on every flush, even within one millisecond. | [`Environment::flush_cache`] |
//! | Signals fire after the state lock is released. | [`Environment::update`] |
//! | [`Environment::snapshot`] has no side effects. | [`Environment::snapshot`] |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use shepherd_proto::{EnvSnapshot, QuotaLimit};

use crate::config::Config;

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Multicast notification with no payload.
///
/// Listeners run synchronously on the firing task, in registration order. A
/// listener registered while the signal fires is first called on the next fire.
#[derive(Default)]
pub struct Signal {
	listeners: RwLock<Vec<Listener>>,
}

impl Signal {
	/// Adds a listener.
	pub fn reg(&self, listener: impl Fn() + Send + Sync + 'static) {
		self.listeners.write().push(Arc::new(listener));
	}

	/// Calls every listener.
	pub fn fire(&self) {
		let listeners = self.listeners.read().clone();
		for listener in &listeners {
			listener();
		}
	}

	/// Number of registered listeners.
	pub fn len(&self) -> usize {
		self.listeners.read().len()
	}

	/// Returns true when nothing listens.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl fmt::Debug for Signal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Signal").field("listeners", &self.len()).finish()
	}
}

#[derive(Debug, Clone)]
struct EnvState {
	version: u64,
	fresh_key: u64,
	http_unsafe_origin: String,
	http_address: String,
	http_port: u16,
	http_safe_port: u16,
	websocket_port: u16,
	offline_mode: bool,
	max_workers: usize,
	limits: BTreeMap<String, QuotaLimit>,
}

#[derive(Debug)]
struct Inner {
	state: RwLock<EnvState>,
	bytes_written: AtomicU64,
	env_updated: Signal,
	cache_flushed: Signal,
}

/// Shared handle to the primary's environment.
#[derive(Debug, Clone)]
pub struct Environment {
	inner: Arc<Inner>,
}

impl Environment {
	/// Builds the environment from validated configuration and the pool size.
	pub fn new(config: &Config, max_workers: usize) -> Self {
		let state = EnvState {
			version: 1,
			fresh_key: now_millis(),
			http_unsafe_origin: config.http_unsafe_origin.trim().to_owned(),
			http_address: config.http_address.clone(),
			http_port: config.http_port,
			http_safe_port: config.http_safe_port,
			websocket_port: config.websocket_port,
			offline_mode: config.offline_mode,
			max_workers,
			limits: config.limits.clone(),
		};
		Self {
			inner: Arc::new(Inner {
				state: RwLock::new(state),
				bytes_written: AtomicU64::new(0),
				env_updated: Signal::default(),
				cache_flushed: Signal::default(),
			}),
		}
	}

	/// Copies the current state.
	pub fn snapshot(&self) -> EnvSnapshot {
		let state = self.inner.state.read();
		EnvSnapshot {
			version: state.version,
			fresh_key: state.fresh_key,
			http_unsafe_origin: state.http_unsafe_origin.clone(),
			http_address: state.http_address.clone(),
			http_port: state.http_port,
			http_safe_port: state.http_safe_port,
			websocket_port: state.websocket_port,
			offline_mode: state.offline_mode,
			max_workers: state.max_workers,
			limits: state.limits.clone(),
		}
	}

	pub fn version(&self) -> u64 {
		self.inner.state.read().version
	}

	pub fn fresh_key(&self) -> u64 {
		self.inner.state.read().fresh_key
	}

	pub fn offline_mode(&self) -> bool {
		self.inner.state.read().offline_mode
	}

	/// Replaces the cached quota limits.
	pub fn set_limits(&self, limits: BTreeMap<String, QuotaLimit>) {
		self.update(|state| state.limits = limits);
	}

	pub fn set_offline_mode(&self, offline: bool) {
		self.update(|state| state.offline_mode = offline);
	}

	/// Forces an `ENV_UPDATE` broadcast without changing any field except the version.
	pub fn touch(&self) {
		self.update(|_| {});
	}

	/// Rotates the freshness key and fires [`Environment::on_cache_flushed`] listeners.
	pub fn flush_cache(&self) {
		{
			let mut state = self.inner.state.write();
			state.fresh_key = now_millis().max(state.fresh_key + 1);
		}
		self.inner.cache_flushed.fire();
	}

	/// Adds to the outbound byte counter.
	pub fn record_bytes_written(&self, n: u64) {
		self.inner.bytes_written.fetch_add(n, Ordering::Relaxed);
	}

	/// Total bytes the primary has written to worker channels.
	pub fn bytes_written(&self) -> u64 {
		self.inner.bytes_written.load(Ordering::Relaxed)
	}

	/// Fired after every setter.
	pub fn on_env_updated(&self) -> &Signal {
		&self.inner.env_updated
	}

	/// Fired after every [`Environment::flush_cache`].
	pub fn on_cache_flushed(&self) -> &Signal {
		&self.inner.cache_flushed
	}

	fn update(&self, mutate: impl FnOnce(&mut EnvState)) {
		{
			let mut state = self.inner.state.write();
			mutate(&mut state);
			state.version += 1;
		}
		self.inner.env_updated.fire();
	}
}

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
