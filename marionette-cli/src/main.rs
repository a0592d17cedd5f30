#![forbid(unsafe_code)]

mod pt;
mod run;
mod socks5;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use marionette_core::MarionetteConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marionette", version, about = "Programmable format-driven traffic obfuscation")]
struct Cli {
	/// Configuration file (TOML)
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Extra formats, laid out as <dir>/<name>/<version>.toml
	#[arg(long, global = true)]
	format_dir: Option<PathBuf>,
	/// More logging (-v debug, -vv trace); RUST_LOG takes precedence
	#[arg(short, long, action = ArgAction::Count, global = true)]
	verbose: u8,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Accept plain TCP locally and tunnel each connection to a marionette server
	Client {
		/// Local plaintext listen address
		#[arg(long)]
		bind: Option<String>,
		/// Marionette server address
		#[arg(long)]
		server: Option<String>,
		/// Format as name[:version]
		#[arg(long)]
		format: Option<String>,
	},
	/// Accept marionette connections and forward every stream to a proxy address
	Server {
		#[arg(long)]
		bind: Option<String>,
		/// Where decoded streams are forwarded
		#[arg(long)]
		proxy: Option<String>,
		#[arg(long)]
		format: Option<String>,
	},
	/// Tor pluggable transport, client side (SOCKS5)
	PtClient {
		#[arg(long)]
		format: Option<String>,
	},
	/// Tor pluggable transport, server side
	PtServer {
		#[arg(long)]
		format: Option<String>,
	},
	/// List the available formats
	Formats,
}

fn main() -> ExitCode {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) if !e.use_stderr() => {
			let _ = e.print();
			return ExitCode::SUCCESS;
		}
		Err(e) => {
			let _ = e.print();
			return ExitCode::FAILURE;
		}
	};
	match start(cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("error: {e:#}");
			ExitCode::FAILURE
		}
	}
}

fn start(cli: Cli) -> anyhow::Result<()> {
	let cfg = resolve_config(&cli)?;
	init_tracing(cli.verbose, &cfg.log_level);
	if let Command::Formats = cli.command {
		return run::formats(&cfg);
	}
	let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("starting runtime")?;
	rt.block_on(async move {
		match cli.command {
			Command::Client { .. } => run::client(cfg).await,
			Command::Server { .. } => run::server(cfg).await,
			Command::PtClient { .. } => run::pt_client(cfg).await,
			Command::PtServer { .. } => run::pt_server(cfg).await,
			Command::Formats => Ok(()),
		}
	})
}

/// Defaults, then the config file, then `MARIONETTE_*` variables, then flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<MarionetteConfig> {
	let mut cfg = match &cli.config {
		Some(path) => MarionetteConfig::load_from_file(path).with_context(|| format!("loading {}", path.display()))?,
		None => MarionetteConfig::default(),
	};
	cfg.apply_env();
	if let Some(dir) = &cli.format_dir {
		cfg.format_dir = Some(dir.clone());
	}
	match &cli.command {
		Command::Client { bind, server, format } => {
			override_with(&mut cfg.client.bind, bind);
			override_with(&mut cfg.client.server, server);
			override_with(&mut cfg.format, format);
		}
		Command::Server { bind, proxy, format } => {
			override_with(&mut cfg.server.bind, bind);
			override_with(&mut cfg.server.proxy, proxy);
			override_with(&mut cfg.format, format);
		}
		Command::PtClient { format } | Command::PtServer { format } => override_with(&mut cfg.format, format),
		Command::Formats => {}
	}
	cfg.validate().context("invalid configuration")?;
	Ok(cfg)
}

fn override_with(slot: &mut String, value: &Option<String>) {
	if let Some(v) = value {
		slot.clone_from(v);
	}
}

fn init_tracing(verbose: u8, configured: &str) {
	let filter = match std::env::var("RUST_LOG") {
		Ok(v) if !v.trim().is_empty() => EnvFilter::new(v),
		_ => EnvFilter::new(match verbose {
			0 => configured,
			1 => "debug",
			_ => "trace",
		}),
	};
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_override_config() {
		let cli = Cli::parse_from(["marionette", "client", "--server", "10.0.0.1:9000", "--format", "http_simple_blocking"]);
		let cfg = resolve_config(&cli).unwrap();
		assert_eq!(cfg.client.server, "10.0.0.1:9000");
		assert_eq!(cfg.format, "http_simple_blocking");
		assert_eq!(cfg.client.bind, MarionetteConfig::default().client.bind);
	}

	#[test]
	fn bad_address_is_rejected() {
		let cli = Cli::parse_from(["marionette", "server", "--proxy", "not-an-address"]);
		assert!(resolve_config(&cli).is_err());
	}

	#[test]
	fn verbosity_counts() {
		let cli = Cli::parse_from(["marionette", "-vv", "formats"]);
		assert_eq!(cli.verbose, 2);
	}
}
