use std::io;

use anyhow::{Context, Result};
use rank_normalizer::{BotConfig, RankRuntime};
use shared_logging::LogLevel;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const fn tracing_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = BotConfig::from_env().context("failed to load configuration")?;

    // stdout carries the final report only
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing_level(config.logging.level))
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let runtime = RankRuntime::from_config(&config).context("failed to bootstrap rankbot")?;
    let report = runtime.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
