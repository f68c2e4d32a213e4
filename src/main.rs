// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: fwlogd daemon entry point replaying configured memory images.
// Author: Lukas Bower

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use fwlogd::sinks::SinkKind;
use fwlogd::{Config, LogCollector, MemoryImageDevice};

/// Firmware log collection daemon.
#[derive(Debug, Parser)]
#[command(name = "fwlogd", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override `collection.target_dir`.
    #[arg(long)]
    target_dir: Option<PathBuf>,
    /// Override `collection.polling_interval_ms`.
    #[arg(long)]
    polling_interval_ms: Option<u64>,
    /// Sinks to start on every device, replacing `collection.auto_start`.
    #[arg(long = "start", value_name = "SINK")]
    start: Vec<SinkKind>,
    /// Exit after this many seconds instead of running forever.
    #[arg(long)]
    run_for_secs: Option<u64>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.target_dir {
        config.collection.target_dir = dir.clone();
    }
    if let Some(ms) = cli.polling_interval_ms {
        config.collection.polling_interval_ms = ms;
    }
    if !cli.start.is_empty() {
        config.collection.auto_start = cli.start.clone();
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let collector = LogCollector::new(&config).context("starting collector")?;
    for dev in &config.devices {
        let device = MemoryImageDevice::from_dump_file(
            dev.name.clone(),
            dev.baseband,
            &dev.dump,
            dev.base_address,
        )
        .with_context(|| format!("loading memory image {}", dev.dump.display()))?;
        collector
            .add_device(Arc::new(device))
            .with_context(|| format!("adding device {}", dev.name))?;
    }
    info!(
        "fwlogd running with {} device(s), recording to {}",
        collector.devices().len(),
        config.collection.target_dir.display()
    );

    match cli.run_for_secs {
        Some(secs) => thread::sleep(Duration::from_secs(secs)),
        None => loop {
            thread::park();
        },
    }
    collector.shutdown();
    Ok(())
}
