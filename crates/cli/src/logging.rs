use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Which process is installing the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Primary,
	/// stdout carries the command channel, so workers only ever log to stderr.
	Worker,
}

fn filter(default_level: &str, verbose: bool) -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("shepherd=trace,debug")
		} else {
			EnvFilter::new(default_level)
		}
	})
}

/// Installs the global subscriber.
///
/// With `SHEPHERD_LOG_DIR` set, the primary writes to
/// `<dir>/shepherd.<pid>.log` instead of stderr.
pub fn setup_tracing(role: Role, default_level: &str, verbose: bool) {
	if role == Role::Primary
		&& let Some(log_dir) = std::env::var("SHEPHERD_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("shepherd.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_target(true);
			tracing_subscriber::registry()
				.with(filter(default_level, verbose))
				.with(file_layer)
				.init();
			tracing::info!(path = ?log_path, "tracing.init");
			return;
		}
	}

	tracing_subscriber::registry()
		.with(filter(default_level, verbose))
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();
}
