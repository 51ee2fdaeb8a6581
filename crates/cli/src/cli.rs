use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(about = "Supervises a pool of worker processes and routes their commands")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
	/// Configuration file
	#[arg(short, long, value_name = "PATH", default_value = "shepherd.toml")]
	pub config: PathBuf,

	/// Override `max_workers` from the configuration (0 = all cores)
	#[arg(long, value_name = "N")]
	pub max_workers: Option<usize>,

	/// Seconds to wait for workers to exit on shutdown before killing them
	#[arg(long, value_name = "SECS", default_value_t = 10)]
	pub shutdown_timeout: u64,

	/// Verbose logging
	#[arg(short, long)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Option<Command>,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	/// Run the primary process (default)
	Primary,
	/// Worker entry point; started by the primary
	#[command(hide = true)]
	Worker,
}
