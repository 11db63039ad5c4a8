use std::fs::File;
use std::io::stdout;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use server::log::{self, TransferLogLayer};
use server::{Privileges, Role, Supervisor};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter, fmt, prelude::*};

use crate::args::{Cli, Cmd};

mod args;

fn main() -> Result<()> {
    let args = Cli::parse();
    match args.cmd {
        Cmd::Serve {
            config,
            root,
            ip,
            port,
            transfer_log,
        } => serve(config, config::Overrides { root, ip, port }, transfer_log),
        Cmd::Logs { logs } => {
            log::print_logs(&logs, stdout())
                .with_context(|| format!("Failed to print logs from \"{}\"", logs.display()))?;
            Ok(())
        }
    }
}

fn serve(
    config_file: Option<PathBuf>,
    overrides: config::Overrides,
    transfer_log: Option<PathBuf>,
) -> Result<()> {
    let config = config::load(config_file.as_deref(), overrides)?;
    let transfer_log = transfer_log.or_else(|| config.transfer_log.clone());
    setup_logging(transfer_log.as_deref())?;

    let privileges = Privileges::from_env()?;
    privileges.minimize()?;
    let supervisor = Supervisor::new(config, privileges)?;
    match supervisor.run()? {
        Role::Exit => Ok(()),
        Role::Worker(seed) => {
            seed.serve().context("Session ended abnormally")?;
            info!("Session finished");
            Ok(())
        }
    }
}

fn setup_logging(transfer_log: Option<&Path>) -> Result<()> {
    let logfile = transfer_log.map(make_logfile).transpose()?;
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_filter(filter::filter_fn(|metadata| metadata.target() != log::TARGET))
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            TransferLogLayer::new(logfile)
                .with_filter(filter::filter_fn(|metadata| metadata.target() == log::TARGET)),
        )
        .init();
    Ok(())
}

fn make_logfile(path: &Path) -> Result<File> {
    File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Unable to open transfer log \"{}\"", path.display()))
}
