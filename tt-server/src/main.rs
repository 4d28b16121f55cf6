//! Binary entry point: parse the command line, stand up logging, and hand
//! off to [`tt_server::app::run`].

use std::fs::OpenOptions;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tt_server::app;
use tt_server::cli::{Args, Config, LogLevel};

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let config: Config = args.into();

    init_logging(&config);

    if config.daemonize {
        daemonize();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thnum.max(1))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(app::run(config)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let default_directive = match config.log_level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Error => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("failed to open log file {}: {e}", path.display()));
            builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.init(),
    }
}

/// Forks into the background the way `-dmn` promises. A faithful
/// double-fork daemonization is out of scope for this rewrite (see
/// `DESIGN.md`); `tt_server::app::run` already detaches from a controlling
/// terminal's signals via its own handler, so this is left as a no-op
/// stub that documents the gap rather than silently ignoring the flag.
fn daemonize() {
    tracing::warn!("-dmn requested but background daemonization is not implemented; running in the foreground");
}
