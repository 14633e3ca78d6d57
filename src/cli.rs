//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using
//! the `clap` crate. Flags that mirror configuration keys are exposed to
//! `figment` as the highest-priority configuration layer.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Sends one notification to a Telegram chat, retrying on transient failures.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Chat to deliver to, overriding `telegram.chat_id`.
    #[arg(long, value_name = "ID")]
    pub chat_id: Option<String>,

    /// Bot API base URL, overriding `telegram.api_url`.
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,

    /// Total delivery attempts per message.
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Timeout for one attempt in milliseconds.
    #[arg(long, value_name = "MS")]
    pub attempt_timeout_ms: Option<u64>,

    /// Delay between attempts in milliseconds.
    #[arg(long, value_name = "MS")]
    pub backoff_ms: Option<u64>,

    /// Double the delay after every failed attempt.
    #[arg(long)]
    pub exponential_backoff: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Message text. Read from stdin when omitted.
    #[arg(value_name = "MESSAGE")]
    pub message: Option<String>,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        let mut telegram = Dict::new();
        if let Some(chat_id) = &self.chat_id {
            telegram.insert("chat_id".into(), Value::from(chat_id.clone()));
        }
        if let Some(url) = &self.api_url {
            telegram.insert("api_url".into(), Value::from(url.clone()));
        }
        if !telegram.is_empty() {
            dict.insert("telegram".into(), Value::from(telegram));
        }

        let mut delivery = Dict::new();
        if let Some(attempts) = self.max_attempts {
            delivery.insert("max_attempts".into(), Value::from(attempts));
        }
        if let Some(timeout) = self.attempt_timeout_ms {
            delivery.insert("attempt_timeout_ms".into(), Value::from(timeout));
        }
        if let Some(backoff) = self.backoff_ms {
            delivery.insert("backoff_ms".into(), Value::from(backoff));
        }
        // Only an explicit flag overrides the configured strategy.
        if self.exponential_backoff {
            delivery.insert("backoff".into(), Value::from("Exponential"));
        }
        if !delivery.is_empty() {
            dict.insert("delivery".into(), Value::from(delivery));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
