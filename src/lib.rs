//! trapnotify - reliable delivery of event notifications to a Telegram chat
//!
//! The library encodes Bot API `sendMessage` requests itself, writes them
//! over a pluggable transport, and retries transient failures with a
//! bounded, clock-driven backoff.
pub mod cli;
pub mod clock;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod dispatcher;
pub mod transport;
pub mod wire;
#[cfg(feature = "test-utils")]
pub mod test_utils;

// Re-export core types for convenience
pub use crate::core::*;
pub use dispatcher::{
    BackoffStrategy, DeliveryError, Dispatch, DispatcherConfig, NotificationDispatcher,
    TransientCause, ValidationError,
};
