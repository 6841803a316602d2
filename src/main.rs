//! p10d - a federated IRC server daemon

use clap::Parser;
use p10d_core::{Config, Server};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Process exit statuses understood by init scripts
const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_RUNNING: u8 = 3;

/// A federated IRC server daemon
#[derive(Parser)]
#[command(name = "p10d")]
#[command(about = "A federated IRC server speaking the tokenized server-to-server dialect")]
#[command(version)]
struct Cli {
    /// Run in the foreground (supervision is the service manager's job)
    #[arg(short = 'n')]
    foreground: bool,

    /// Serve a single session over stdin/stdout, for console testing
    #[arg(short = 't')]
    test_console: bool,

    /// Configuration file path
    #[arg(short = 'f')]
    config: Option<PathBuf>,

    /// Debug level (0 = errors only, 3+ = full debug)
    #[arg(short = 'x', default_value_t = 2)]
    debug_level: u8,

    /// Change to this directory before reading anything
    #[arg(short = 'd')]
    chdir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug_level);

    if let Some(ref dir) = cli.chdir {
        if let Err(e) = std::env::set_current_dir(dir) {
            error!("cannot chdir to {}: {}", dir.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let pid_file = PathBuf::from("p10d.pid");
    if pid_file.exists() {
        error!("pid file {} exists; daemon already running?", pid_file.display());
        return ExitCode::from(EXIT_RUNNING);
    }
    if let Err(e) = std::fs::write(&pid_file, format!("{}\n", std::process::id())) {
        error!("cannot write pid file: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let server = match Server::new(config, Some(config_path.display().to_string())) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("configuration error: {}", e);
            let _ = std::fs::remove_file(&pid_file);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            let _ = std::fs::remove_file(&pid_file);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if !cli.foreground {
        info!("running attached; pass -n to make this explicit");
    }

    let local = tokio::task::LocalSet::new();
    let code = local.block_on(&runtime, async move {
        if cli.test_console {
            match server.run_stdio().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("console session failed: {}", e);
                    ExitCode::from(EXIT_CONFIG)
                }
            }
        } else {
            tokio::select! {
                result = server.clone().serve() => match result {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        error!("{}", e);
                        ExitCode::from(EXIT_BIND)
                    }
                },
                _ = shutdown_signal() => {
                    info!("shutting down");
                    ExitCode::SUCCESS
                }
            }
        }
    });

    let _ = std::fs::remove_file(&pid_file);
    code
}

fn init_logging(level: u8) {
    let max_level = match level {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .init();
}

/// `$HOME/.p10d.toml` when HOME is set, `./p10d.toml` otherwise.
fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".p10d.toml"),
        None => PathBuf::from("p10d.toml"),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}
