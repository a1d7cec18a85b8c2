use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gpud")]
#[command(about = "Share this host's GPUs with remote clients")]
#[command(version)]
#[command(styles = styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Config file (default: $XDG_CONFIG_HOME/gpud/config.json)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Run the agent until interrupted
	Run(RunArgs),

	/// Query a running agent
	Status {
		/// Agent address (default: the configured one)
		#[arg(long, value_name = "ADDR")]
		address: Option<String>,
	},

	/// Print the effective configuration
	Config {
		/// Also write it to the config file
		#[arg(long)]
		write: bool,
	},
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
	/// Listen address
	#[arg(long, value_name = "ADDR")]
	pub address: Option<String>,

	/// Maximum concurrent sessions
	#[arg(long, value_name = "N")]
	pub max_sessions: Option<usize>,

	/// Seconds an empty session may stay idle before it closes
	#[arg(long, value_name = "SECS")]
	pub idle_timeout: Option<u64>,
}

/// Help colors in the style of cargo.
fn styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_run_flags() {
		let cli = Cli::try_parse_from(["gpud", "-vv", "run", "--address", "0.0.0.0:1", "--max-sessions", "3"]).unwrap();
		assert_eq!(cli.verbose, 2);
		let Command::Run(args) = cli.command else {
			panic!("expected run");
		};
		assert_eq!(args.address.as_deref(), Some("0.0.0.0:1"));
		assert_eq!(args.max_sessions, Some(3));
		assert_eq!(args.idle_timeout, None);
	}

	#[test]
	fn test_global_config_after_subcommand() {
		let cli = Cli::try_parse_from(["gpud", "status", "--config", "/tmp/gpud.json"]).unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/gpud.json")));
		assert!(matches!(cli.command, Command::Status { address: None }));
	}

	#[test]
	fn test_cli_definition_is_valid() {
		use clap::CommandFactory;
		Cli::command().debug_assert();
	}
}
