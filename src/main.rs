// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod bridge;
mod config;
mod render;

use std::ffi::OsString;

use anyhow::Context as _;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "waybridge")]
#[command(about = "Run wayland clients on an X server", long_about = None)]
struct Cli {
    /// The wayland socket name to bind. Auto-generated by default.
    #[arg(long, value_name = "NAME")]
    socket: Option<OsString>,

    /// A command to launch with WAYLAND_DISPLAY pointing at the bridge.
    #[arg(trailing_var_arg = true)]
    command: Vec<OsString>,
}

fn main() {
    if let Err(err) = run() {
        // One line, then a non-zero exit.
        eprintln!("waybridge: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Cli::parse();

    let filter = EnvFilter::try_from_env("WAYBRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = config::Config::from_env();
    config.socket_name = args.socket;
    config.command = args.command;

    debug!(?config, "starting up");

    let renderer = Box::new(render::PixmapBackend::new()?);

    let mut bridge = bridge::Bridge::new(config, renderer)
        .context("failed to start the bridge")?;

    info!(socket = ?bridge.socket_name(), "listening");

    bridge.run()
}
