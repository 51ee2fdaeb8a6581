//! Primary configuration loaded from TOML.
//!
//! ```toml
//! http_unsafe_origin = "https://pad.example.org"
//! max_workers = 4
//!
//! [relaunch]
//! startup_crash_delay_ms = 1000
//!
//! [limits.alice]
//! limit = 53687091200
//! plan = "team"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shepherd_proto::QuotaLimit;
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal at startup: no worker is launched.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The configuration file could not be read.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path that failed to read.
		path: PathBuf,
		/// Underlying error.
		error: std::io::Error,
	},
	/// The file is not valid TOML or has the wrong shape.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),
	/// `http_unsafe_origin` is unset or blank.
	#[error("no 'http_unsafe_origin' provided")]
	MissingOrigin,
	/// `http_unsafe_origin` is not an absolute URL.
	#[error("invalid 'http_unsafe_origin' {origin:?}: {source}")]
	InvalidOrigin {
		/// The configured value.
		origin: String,
		/// Parse failure.
		source: url::ParseError,
	},
}

/// Crash-loop guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaunchConfig {
	/// Delay before relaunching a worker that died before it ever came online.
	pub startup_crash_delay_ms: u64,
}

impl RelaunchConfig {
	/// Delay as a [`Duration`].
	pub fn startup_crash_delay(&self) -> Duration {
		Duration::from_millis(self.startup_crash_delay_ms)
	}
}

impl Default for RelaunchConfig {
	fn default() -> Self {
		Self { startup_crash_delay_ms: 1000 }
	}
}

/// Top-level primary configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Origin clients reach the deployment at. Required.
	pub http_unsafe_origin: String,
	/// Address workers bind to.
	pub http_address: String,
	/// Main HTTP port.
	pub http_port: u16,
	/// Port for the sandboxed origin.
	pub http_safe_port: u16,
	/// Websocket port.
	pub websocket_port: u16,
	/// Upper bound on the pool size; 0 uses every available core.
	pub max_workers: usize,
	/// Worker executable. Defaults to the running binary.
	pub worker_program: Option<PathBuf>,
	/// Default log filter when `RUST_LOG` is unset.
	pub log_level: String,
	/// Run without outbound network access.
	pub offline_mode: bool,
	/// Crash-loop guard.
	pub relaunch: RelaunchConfig,
	/// Cached quota limits by account key.
	pub limits: BTreeMap<String, QuotaLimit>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			http_unsafe_origin: String::new(),
			http_address: "0.0.0.0".to_owned(),
			http_port: 3000,
			http_safe_port: 3001,
			websocket_port: 3003,
			max_workers: 0,
			worker_program: None,
			log_level: "info".to_owned(),
			offline_mode: false,
			relaunch: RelaunchConfig::default(),
			limits: BTreeMap::new(),
		}
	}
}

impl Config {
	/// Reads and parses a configuration file without validating it.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}

	/// Parses configuration from TOML text.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::Parse`] on malformed input.
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	/// Checks the settings that must hold before any worker is launched.
	///
	/// Returns the parsed origin.
	///
	/// # Errors
	///
	/// Returns [`ConfigError::MissingOrigin`] or [`ConfigError::InvalidOrigin`].
	pub fn validate(&self) -> Result<Url, ConfigError> {
		let origin = self.http_unsafe_origin.trim();
		if origin.is_empty() {
			return Err(ConfigError::MissingOrigin);
		}
		Url::parse(origin).map_err(|source| ConfigError::InvalidOrigin {
			origin: origin.to_owned(),
			source,
		})
	}

	/// Pool size for a machine with `available` processing units.
	pub fn worker_count(&self, available: usize) -> usize {
		let available = available.max(1);
		match self.max_workers {
			0 => available,
			limit => limit.min(available),
		}
	}
}
