//! Configuration management for trapnotify
//!
//! This module defines the main `Config` struct and its sub-structs. It
//! uses the `figment` crate to layer built-in defaults, an optional TOML
//! file, `TRAPNOTIFY_` environment variables and command-line flags.

use crate::cli::Cli;
use crate::core::ChatId;
use crate::dispatcher::{BackoffStrategy, DispatcherConfig, DEFAULT_MAX_TEXT_LEN};
use crate::transport::net::Endpoint;
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Where and to whom notifications are sent.
    pub telegram: TelegramConfig,
    /// Retry policy for a single notification.
    pub delivery: DeliveryConfig,
}

/// Configuration for the Telegram endpoint.
#[derive(Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    /// Base URL of the Bot API.
    pub api_url: String,
    /// Bot token issued by BotFather.
    pub bot_token: String,
    /// The chat every notification goes to. Numeric ids may be written
    /// as numbers or strings.
    #[serde(deserialize_with = "string_or_integer")]
    pub chat_id: String,
    /// PEM file with the root certificate used to verify the endpoint.
    pub ca_cert_path: Option<PathBuf>,
    /// Trust only `ca_cert_path`, ignoring the platform root store.
    #[serde(default)]
    pub only_custom_ca: bool,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_url", &self.api_url)
            .field("bot_token", &crate::diagnostics::mask_token(&self.bot_token))
            .field("chat_id", &self.chat_id)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("only_custom_ca", &self.only_custom_ca)
            .finish()
    }
}

fn string_or_integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// Retry and size settings for delivery.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeliveryConfig {
    /// Total attempts per message, including the first.
    pub max_attempts: u32,
    /// How long one attempt may take, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Delay before a retry, in milliseconds.
    pub backoff_ms: u64,
    /// Whether the delay stays fixed or doubles per attempt.
    pub backoff: BackoffStrategy,
    /// Longest accepted message text, in characters.
    pub max_text_len: usize,
}

impl Config {
    /// Loads the application configuration.
    ///
    /// Sources are applied in order, later ones winning: defaults, the
    /// TOML file named by `--config`, environment variables such as
    /// `TRAPNOTIFY_TELEGRAM__BOT_TOKEN`, then command-line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config {
            if !path.exists() {
                bail!("configuration file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Config = figment
            .merge(Env::prefixed("TRAPNOTIFY_").split("__"))
            .merge(cli.clone())
            .extract()?;
        Ok(config)
    }

    /// Rejects settings the dispatcher cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token is not set");
        }
        if self.telegram.chat_id.trim().is_empty() {
            bail!("telegram.chat_id is not set");
        }
        if let Err(e) = Endpoint::parse(&self.telegram.api_url) {
            bail!("telegram.api_url is invalid: {}", e);
        }
        if self.telegram.only_custom_ca && self.telegram.ca_cert_path.is_none() {
            bail!("telegram.only_custom_ca requires telegram.ca_cert_path");
        }
        if self.delivery.max_attempts == 0 {
            bail!("delivery.max_attempts must be at least 1");
        }
        if self.delivery.attempt_timeout_ms == 0 {
            bail!("delivery.attempt_timeout_ms must be greater than 0");
        }
        if self.delivery.max_text_len == 0 {
            bail!("delivery.max_text_len must be greater than 0");
        }
        Ok(())
    }

    /// The parsed endpoint address.
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.telegram.api_url).map_err(|e| anyhow::anyhow!(e))
    }

    /// Builds the dispatcher settings from this configuration.
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        let endpoint = self.endpoint()?;
        Ok(DispatcherConfig {
            host: endpoint.host_header(),
            bot_token: self.telegram.bot_token.clone(),
            destination: ChatId::new(self.telegram.chat_id.trim()),
            max_attempts: self.delivery.max_attempts,
            attempt_timeout: Duration::from_millis(self.delivery.attempt_timeout_ms),
            backoff: Duration::from_millis(self.delivery.backoff_ms),
            backoff_strategy: self.delivery.backoff,
            max_text_len: self.delivery.max_text_len,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            telegram: TelegramConfig {
                api_url: "https://api.telegram.org".to_string(),
                bot_token: String::new(),
                chat_id: String::new(),
                ca_cert_path: None,
                only_custom_ca: false,
            },
            delivery: DeliveryConfig {
                max_attempts: 3,
                attempt_timeout_ms: 10_000,
                backoff_ms: 1_000,
                backoff: BackoffStrategy::Fixed,
                max_text_len: DEFAULT_MAX_TEXT_LEN,
            },
        }
    }
}
