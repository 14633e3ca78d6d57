//! Core domain types and service traits for trapnotify
//!
//! This module defines the values that flow through a dispatch and the
//! trait contracts for the two collaborators the dispatcher depends on:
//! the byte transport and the clock used for backoff.

use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque handle identifying the chat a notification is delivered to.
///
/// Telegram accepts both numeric ids (`"1007315026"`) and public channel
/// usernames (`"@channel"`), so the handle is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// A text notification addressed to one chat.
///
/// The value is immutable once built. Size limits are enforced by the
/// dispatcher when it is sent, not at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    destination: ChatId,
    text: String,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<ChatId>, text: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            text: text.into(),
        }
    }

    pub fn destination(&self) -> &ChatId {
        &self.destination
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length of the text in characters, the unit the Bot API limits on.
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// The endpoint's acknowledgement of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Id the endpoint assigned to the message, when it reported one.
    pub message_id: Option<i64>,
    pub chat_id: Option<i64>,
}

/// How a single delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The endpoint acknowledged the request.
    Delivered,
    /// The attempt failed in a way that may succeed on retry.
    Transient(String),
    /// The endpoint refused the request; retrying cannot help.
    Rejected(String),
}

/// Record of one round-trip made during a dispatch.
///
/// Lives only as long as the `Dispatch` report that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Wall-clock time the attempt started.
    pub started_at: DateTime<Utc>,
    /// How long the attempt took, including the wait for the response.
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

impl DeliveryAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Delivered)
    }

    /// The failure reason, if the attempt failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            AttemptOutcome::Delivered => None,
            AttemptOutcome::Transient(reason) | AttemptOutcome::Rejected(reason) => Some(reason),
        }
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// A connected byte stream to the messaging endpoint.
///
/// Implementations own the underlying socket. The dispatcher serializes
/// access so at most one request/response exchange is in flight at a time.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection (TCP and, where configured, TLS).
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Returns true if the transport believes it has a usable connection.
    fn is_open(&self) -> bool;

    /// Writes the whole buffer to the stream.
    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Reads available bytes into `buf`.
    ///
    /// # Returns
    /// * `Ok(0)` if the peer closed the stream
    /// * `Ok(n)` with the number of bytes read otherwise
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Drops the connection. Closing an already closed transport is a no-op.
    async fn close(&mut self);
}

/// Source of delays between retry attempts.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}
