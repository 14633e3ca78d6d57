//! trapnotify - send one notification to a Telegram chat
//!
//! Loads configuration, installs the TLS trust anchor, builds a dispatcher
//! and delivers a single message taken from the command line or stdin.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use trapnotify::{
    cli::Cli,
    config::Config,
    diagnostics::{self, mask_token},
    dispatcher::NotificationDispatcher,
    transport::{NetTransport, TlsTrust},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(err) => {
            // Logging is not configured yet; fall back to the default level.
            diagnostics::init_tracing("info");
            error!("Failed to load configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    diagnostics::init_tracing(&config.log_level);

    match run(cli, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<bool> {
    info!("-------------------- Configuration --------------------");
    info!("API URL: {}", config.telegram.api_url);
    info!("Bot Token: {}", mask_token(&config.telegram.bot_token));
    info!("Chat ID: {}", config.telegram.chat_id);
    match &config.telegram.ca_cert_path {
        Some(path) => info!(
            "Root Certificate: {}{}",
            path.display(),
            if config.telegram.only_custom_ca { " (pinned)" } else { "" }
        ),
        None => info!("Root Certificate: System Default"),
    }
    info!("Max Attempts: {}", config.delivery.max_attempts);
    info!("Attempt Timeout: {}ms", config.delivery.attempt_timeout_ms);
    info!(
        "Backoff: {}ms ({:?})",
        config.delivery.backoff_ms, config.delivery.backoff
    );
    info!("-------------------------------------------------------");

    let text = match cli.message {
        Some(text) => text,
        None => read_stdin().await?,
    };

    // The trust anchor is installed once, before any send.
    let trust = match &config.telegram.ca_cert_path {
        Some(path) => TlsTrust::from_pem_file(path, config.telegram.only_custom_ca)
            .with_context(|| format!("failed to read root certificate {}", path.display()))?,
        None => TlsTrust::system(),
    };
    let dispatcher_config = config.dispatcher_config()?;
    let transport = NetTransport::new(
        config.endpoint()?,
        &trust,
        dispatcher_config.attempt_timeout,
    )
    .context("failed to prepare transport")?;
    let dispatcher = NotificationDispatcher::new(dispatcher_config, transport);

    let message = dispatcher.message(text);
    let dispatch = tokio::select! {
        dispatch = dispatcher.dispatch(&message) => Some(dispatch),
        _ = tokio::signal::ctrl_c() => None,
    };
    dispatcher.shutdown().await;

    let Some(dispatch) = dispatch else {
        warn!("Interrupted, notification abandoned.");
        return Ok(false);
    };
    diagnostics::report(&dispatch);
    Ok(dispatch.result.is_ok())
}

async fn read_stdin() -> Result<String> {
    let mut text = String::new();
    tokio::io::stdin()
        .read_to_string(&mut text)
        .await
        .context("failed to read message from stdin")?;
    let text = text.trim_end_matches(['\r', '\n']).to_string();
    if text.is_empty() {
        bail!("no message given on the command line or stdin");
    }
    Ok(text)
}
