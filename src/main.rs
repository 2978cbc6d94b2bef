//! The `serverd` driver: parse arguments, load the configuration,
//! assemble a [`Process`] for the requested role, and park.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{LevelFilter, error, info};

use serverd::config::Config;
use serverd::proc::{ProcError, Process, Role};

#[derive(Debug, Parser)]
#[command(name = "serverd", about = "Clustered file-location and redirection service")]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', value_name = "conf")]
    config: Option<PathBuf>,

    /// Enable debug tracing.
    #[arg(short = 'd')]
    debug: bool,

    /// Log file (stderr when absent).
    #[arg(short = 'l', value_name = "log")]
    log: Option<PathBuf>,

    /// Run as a manager (redirector).
    #[arg(short = 'm', conflicts_with = "server")]
    manager: bool,

    /// Run as a data server (the default).
    #[arg(short = 's')]
    server: bool,

    /// Start with service paused until an admin `cont`.
    #[arg(short = 'w')]
    wait: bool,
}

fn init_logging(debug: bool, log: Option<&PathBuf>) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Some(path) = log {
        match std::fs::File::options().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("serverd: cannot open log {}: {e}", path.display()),
        }
    }
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    // Environment overrides for the config and log paths.
    let config_path = std::env::var_os("SERVERD_CONFIG")
        .map(PathBuf::from)
        .or(args.config);
    let log_path = std::env::var_os("SERVERD_LOG")
        .map(PathBuf::from)
        .or(args.log);
    init_logging(args.debug, log_path.as_ref());

    let cfg = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("serverd: {e}");
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };

    let role = if args.manager {
        Role::Manager
    } else {
        Role::Server
    };
    let admin_path = cfg.admin_path.clone();
    let process = match Process::assemble(cfg, role) {
        Ok(p) => p,
        Err(ProcError::Threads(e)) => {
            error!("serverd: {e}");
            return ExitCode::from(3);
        }
        Err(e) => {
            error!("serverd: {e}");
            return ExitCode::from(4);
        }
    };
    if args.wait {
        if let Some(mgr) = &process.manager {
            mgr.set_disabled(true);
        }
        if let Some(sub) = &process.subscriber {
            sub.set_suspended(true);
        }
        info!("service paused; waiting for admin cont");
    }
    if let Err(e) = process.start() {
        error!("serverd: {e}");
        return ExitCode::from(3);
    }
    if let Err(e) = process.start_admin(&admin_path) {
        error!("serverd: admin channel: {e}");
    }

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
