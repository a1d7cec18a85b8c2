//! Subscriber setup for the `gpud` binary.
//!
//! Events carry a `target` field naming their area (`gpud.session`,
//! `gpud.connection`, ...). Filtering still works on module paths, so the
//! defaults below name the crates those areas live in.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV: &str = "GPUD_LOG";

/// Default directives for a `-v` count.
pub fn default_filter(verbosity: u8) -> &'static str {
	match verbosity {
		// warnings only, task supervision limited to errors
		0 => "warn,gpud_runtime=error",
		// session, connection and agent lifecycle
		1 => "warn,gpud=info,gpud_cli=info,gpud_runtime=warn",
		// task spawns, tunnel traffic, workload stderr
		2 => "info,gpud=debug,gpud_cli=debug,gpud_runtime=debug",
		_ => "debug,hyper=info,tungstenite=info,tokio_tungstenite=info",
	}
}

fn env_filter(verbosity: u8) -> EnvFilter {
	[LOG_ENV, EnvFilter::DEFAULT_ENV]
		.into_iter()
		.find_map(|var| EnvFilter::try_from_env(var).ok())
		.unwrap_or_else(|| EnvFilter::new(default_filter(verbosity)))
}

pub fn init_logging(verbosity: u8) {
	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter(verbosity))
		.with_writer(stderr)
		.with_target(verbosity >= 2)
		.with_level(true)
		.compact()
		.init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_filters_parse() {
		for verbosity in 0..=4 {
			let directives = default_filter(verbosity);
			assert!(EnvFilter::try_new(directives).is_ok(), "bad directives for -v x{verbosity}: {directives}");
		}
	}

	#[test]
	fn test_verbosity_widens_gpud_crates() {
		assert!(!default_filter(0).contains("gpud=info"));
		assert!(default_filter(1).contains("gpud=info"));
		assert!(default_filter(2).contains("gpud=debug"));
		assert_eq!(default_filter(3), default_filter(200));
	}
}
