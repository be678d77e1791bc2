//! LiuProxy remote endpoint command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use liuproxy_remote::{Config, RemoteServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "liuproxy-remote")]
#[command(version = VERSION)]
#[command(about = "Remote endpoint of the LiuProxy encrypted tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "configs/remote.ini")]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if cli.verbose >= 3 {
        logger.filter_module("liuproxy_remote", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config file {:?}", cli.config))?;

    info!("starting server in '{}' mode", config.mode);
    let server = RemoteServer::new(config);
    server.run().await.context("remote server failed")?;

    Ok(())
}
