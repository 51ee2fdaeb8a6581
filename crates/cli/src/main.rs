//! `shepherd` binary.
//!
//! Without a subcommand it runs the primary: load configuration, launch the
//! worker pool, and supervise it until Ctrl-C. The primary re-executes this
//! binary with the hidden `worker` subcommand for each worker.

mod cli;
mod logging;
mod primary;
mod worker;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use logging::Role;
use shepherd_primary::Config;

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	// Single-threaded: handlers and the supervisor pump share one event loop.
	let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

	match cli.command.unwrap_or(Command::Primary) {
		Command::Worker => {
			logging::setup_tracing(Role::Worker, "info", cli.verbose);
			runtime.block_on(worker::run())
		}
		Command::Primary => {
			let mut config = Config::load(&cli.config)
				.with_context(|| format!("loading configuration from {}", cli.config.display()))?;
			if let Some(max_workers) = cli.max_workers {
				config.max_workers = max_workers;
			}
			logging::setup_tracing(Role::Primary, &config.log_level, cli.verbose);
			runtime.block_on(primary::run(&cli, config))
		}
	}
}
