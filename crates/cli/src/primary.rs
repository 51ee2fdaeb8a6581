use std::time::Duration;

use anyhow::Context;
use shepherd_primary::{Config, ConfigError, Primary, StartError};

use crate::cli::Cli;

pub async fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
	let origin = config.http_unsafe_origin.clone();
	let primary = match Primary::builder(config).config_path(&cli.config).start().await {
		Ok(primary) => primary,
		Err(StartError::Config(err @ (ConfigError::MissingOrigin | ConfigError::InvalidOrigin { .. }))) => {
			tracing::error!(http_unsafe_origin = %origin, error = %err, "INVALID_ORIGIN");
			return Err(err.into());
		}
		Err(err) => return Err(err).context("starting primary"),
	};

	tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
	tracing::info!("shutdown.requested");
	let killed = primary.shutdown(Duration::from_secs(cli.shutdown_timeout)).await;
	tracing::info!(killed, "shutdown.complete");
	Ok(())
}
