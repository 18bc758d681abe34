// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use kvm_fleet_monitor::app;
use kvm_fleet_monitor::config::{default_config_path, load_config};

/// KVM fleet monitor: poll virtualization hosts, ship per-instance metrics,
/// reconcile the monitoring backend's inventory.
#[derive(Parser, Debug)]
#[command(name = "kvm-fleet-monitor")]
#[command(about = "Poll a KVM fleet and reconcile the monitoring inventory")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "KVM_FLEET_CONFIG", default_value_os_t = default_config_path())]
    config: PathBuf,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(config.log_file.as_ref())?;

    tracing::info!(
        config = %args.config.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting kvm-fleet-monitor"
    );

    app::run(&config).await?;
    Ok(())
}
