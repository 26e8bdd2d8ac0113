use std::process::ExitCode;

use anyhow::{Context, Result};
use pipecast::config::{AppConfig, DEFAULT_CONFIG_PATH};
use pipecast::relay::{Relay, StartupError};
use pipecast::shutdown::Shutdown;
use pipecast::utils::log;
use pipecast::{error, info, signaling};

#[tokio::main]
async fn main() -> ExitCode {
    // webrtc-rs reports through the `log` facade
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("pipecast stopped: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    AppConfig::init(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path))?;
    let cfg = AppConfig::current().await;
    log::init(&cfg.log);
    info!("pipecast starting, signaling over {:?}", cfg.signaling.mode);

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!("cannot listen for interrupts: {}", e),
        }
        shutdown.trigger();
    });

    let mut connecting = signal.clone();
    let Some(mut channel) = signaling::connect(&cfg.signaling, &mut connecting)
        .await
        .map_err(StartupError::from)?
    else {
        return Ok(());
    };
    let summary = Relay::new(&cfg).run(channel.as_mut(), signal).await?;
    info!("pipecast exiting after {} pacer run(s)", summary.pacers_started);
    Ok(())
}
