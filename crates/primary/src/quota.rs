//! Quota limit refresh used by the `UPDATE_QUOTA` command.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use shepherd_proto::QuotaLimit;
use thiserror::Error;

use crate::env::Environment;

#[derive(Debug, Error)]
pub enum QuotaError {
	#[error("failed to read quota limits from {path}: {error}")]
	Io { path: PathBuf, error: std::io::Error },
	#[error("malformed quota limits: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("quota source unavailable: {0}")]
	Unavailable(String),
}

impl QuotaError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::Io { .. } => "QUOTA_IO",
			Self::Parse(_) => "QUOTA_PARSE",
			Self::Unavailable(_) => "QUOTA_UNAVAILABLE",
		}
	}
}

/// Refreshes the cached quota limits held by the [`Environment`].
#[async_trait]
pub trait QuotaSource: Send + Sync + 'static {
	/// Fetches the current limits and applies them with [`Environment::set_limits`].
	async fn refresh(&self, env: &Environment) -> Result<(), QuotaError>;
}

/// Re-reads the `[limits]` table of the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigQuotaSource {
	path: PathBuf,
}

impl ConfigQuotaSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[derive(Deserialize)]
struct LimitsTable {
	#[serde(default)]
	limits: BTreeMap<String, QuotaLimit>,
}

#[async_trait]
impl QuotaSource for ConfigQuotaSource {
	async fn refresh(&self, env: &Environment) -> Result<(), QuotaError> {
		let text = tokio::fs::read_to_string(&self.path).await.map_err(|error| QuotaError::Io {
			path: self.path.clone(),
			error,
		})?;
		let table: LimitsTable = toml::from_str(&text)?;
		tracing::debug!(accounts = table.limits.len(), "quota.refresh");
		env.set_limits(table.limits);
		Ok(())
	}
}
