use anyhow::Context;
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;
use warden_manager::{boot, config::Config};

#[derive(Debug, Parser)]
#[clap(version, about = "Coverage-guided syscall fuzzing manager")]
struct Settings {
    /// Path to the configuration file (JSON).
    #[clap(long, short = 'c')]
    config: PathBuf,
    /// Dump all VM output to the console and run a single instance.
    #[clap(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("WARDEN_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let mut config = Config::load(&settings.config).context("failed to load config")?;
    if settings.debug {
        config.debug = true;
        config.count = 1;
    }
    boot(config)
}
