//! Entry point: parse the daemon's own CLI flags, install the `tracing`
//! subscriber, then hand off to [`app::run`].
//!
//! This is the `auoms` daemon process itself; the out-of-scope `auomsctl`
//! rule-management CLI is a separate, unimplemented binary (spec.md §1
//! Non-goals).

mod app;
mod signal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/opt/microsoft/auoms/auoms.conf";
const LOG_ENV_VAR: &str = "AUOMS_LOG";

#[derive(Parser, Debug)]
#[command(name = "auoms", about = "Linux host audit telemetry pipeline")]
struct Cli {
    /// Path to the key/value configuration file (spec.md §6).
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides the `data_dir` config key.
    #[arg(long)]
    data_dir: Option<String>,

    /// Stays attached to the controlling terminal instead of daemonizing.
    #[arg(long)]
    foreground: bool,

    /// Default log level when `AUOMS_LOG` is unset.
    #[arg(long, default_value = "info")]
    verbosity: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(&cli.verbosity));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = app::Args {
        config_path: cli.config,
        data_dir_override: cli.data_dir,
        foreground: cli.foreground,
    };

    match app::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "auoms exited with an error");
            ExitCode::FAILURE
        }
    }
}
