// src/main.rs

//! The main entry point for the slicestore server application.

use anyhow::Result;
use slicestore::config::Config;
use slicestore::server;
use std::env;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("slicestore version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "slicestore.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("slicestore.toml");

    // Load the server configuration. If loading fails, print the error and
    // exit; the server cannot run without a valid configuration.
    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override the base data directory if provided on the command line.
    if let Some(index) = args.iter().position(|arg| arg == "--data-dir") {
        match args.get(index + 1) {
            Some(dir) => config.data_dir = dir.clone(),
            None => {
                eprintln!("--data-dir flag requires a value");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with reloading capabilities. The environment wins over
    // the configured level.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
