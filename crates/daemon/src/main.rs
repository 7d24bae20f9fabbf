// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! anvild entry point.

use std::path::PathBuf;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::{EnvFilter, fmt};

use anvil::{Absorber, Emitter, Runtime, config};

/// Compilation accelerator daemon.
#[derive(Parser)]
#[command(name = "anvild", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, env = "ANVIL_CONFIG")]
    config: PathBuf,

    /// Detach from the terminal and run in the background.
    #[arg(long)]
    daemon: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ANVIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();

    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("anvild: {:#}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    if cli.daemon {
        daemonize()?;
    }

    let runtime = Runtime::system();
    let absorber_config = config.absorber.clone();
    let versions = config.versions.clone();

    let mut emitter = Emitter::new(config, runtime.clone())?;
    emitter.run()?;

    let mut absorber = match absorber_config {
        Some(absorber_config) => {
            let mut absorber =
                Absorber::new(&versions, absorber_config, emitter.cache(), runtime);
            absorber.run()?;
            Some(absorber)
        }
        None => None,
    };

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    tracing::info!("anvild running, pid {}", std::process::id());
    signals.forever().next();

    tracing::info!("signal received, shutting down");
    if let Some(absorber) = absorber.as_mut() {
        absorber.shutdown();
    }
    emitter.shutdown();
    Ok(())
}

/// Classic double-fork detach with stdio pointed at /dev/null.
#[allow(unsafe_code)]
fn daemonize() -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
    }

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in 0..=2 {
        unsafe {
            libc::dup2(null.as_raw_fd(), fd);
        }
    }
    Ok(())
}
