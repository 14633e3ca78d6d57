//! Delivery of a single notification with bounded retry.
//!
//! The dispatcher owns the transport behind an async mutex. Each attempt
//! holds the lock from writing the request until the response has been
//! read, so concurrent callers never interleave their exchanges. The lock
//! is released while waiting out the backoff between attempts.

use crate::clock::TokioClock;
use crate::core::{
    AttemptOutcome, ChatId, Clock, DeliveryAttempt, OutboundMessage, SentMessage, Transport,
};
use crate::diagnostics::mask_token;
use crate::transport::TransportError;
use crate::wire::{self, HttpResponse, ReplyVerdict, ResponseParser, SendMessageRequest, WireError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

/// The Bot API's limit on `sendMessage` text, in characters.
pub const DEFAULT_MAX_TEXT_LEN: usize = 4096;

const READ_CHUNK: usize = 4096;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// The delay doubles after every failed attempt.
    Exponential,
}

/// Settings a dispatcher is built with. Immutable once handed over.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Value sent in the `Host` header.
    pub host: String,
    pub bot_token: String,
    /// The only chat this dispatcher delivers to.
    pub destination: ChatId,
    /// Total attempts per message, including the first one.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub max_text_len: usize,
}

impl DispatcherConfig {
    /// Creates a configuration with the default retry policy: three
    /// attempts, ten second attempt timeout, fixed one second backoff.
    pub fn new(
        host: impl Into<String>,
        bot_token: impl Into<String>,
        destination: impl Into<ChatId>,
    ) -> Self {
        Self {
            host: host.into(),
            bot_token: bot_token.into(),
            destination: destination.into(),
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff: Duration::from_secs(1),
            backoff_strategy: BackoffStrategy::Fixed,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }

    /// The delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.backoff.saturating_mul(1u32 << exponent)
            }
        }
    }
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("host", &self.host)
            .field("bot_token", &mask_token(&self.bot_token))
            .field("destination", &self.destination)
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("backoff", &self.backoff)
            .field("backoff_strategy", &self.backoff_strategy)
            .field("max_text_len", &self.max_text_len)
            .finish()
    }
}

/// A message that can never be delivered as given.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,

    #[error("message text is {len} characters, the limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("message is addressed to chat {got}, but this dispatcher delivers to {expected}")]
    WrongDestination { expected: ChatId, got: ChatId },

    #[error("message could not be encoded: {0}")]
    Encoding(String),
}

/// The last failure seen before retries ran out.
#[derive(Error, Debug)]
pub enum TransientCause {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("endpoint unavailable: {0}")]
    Endpoint(String),
}

/// Why a dispatch did not end in delivery.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The message was refused before anything was sent.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// Every attempt failed with a retryable error.
    #[error("delivery failed after {attempts} attempt(s): {cause}")]
    Transient {
        attempts: u32,
        #[source]
        cause: TransientCause,
    },

    /// The endpoint answered and refused the message.
    #[error("endpoint rejected the message: {description}")]
    Rejected {
        code: Option<i64>,
        description: String,
    },
}

/// The full account of one dispatch: every attempt made, and how it ended.
#[derive(Debug)]
pub struct Dispatch {
    pub attempts: Vec<DeliveryAttempt>,
    pub result: Result<SentMessage, DeliveryError>,
}

impl Dispatch {
    fn refused(error: ValidationError) -> Self {
        Self {
            attempts: Vec::new(),
            result: Err(error.into()),
        }
    }
}

enum AttemptFailure {
    Transient {
        cause: TransientCause,
        retry_after: Option<Duration>,
    },
    Rejected {
        code: Option<i64>,
        description: String,
    },
}

struct Link<T> {
    transport: T,
    /// Set while an exchange is running. If it is still set when the next
    /// attempt starts, the previous one was abandoned mid-exchange and the
    /// connection holds unread bytes.
    in_flight: bool,
}

/// Delivers notifications to one fixed chat.
pub struct NotificationDispatcher<T: Transport, C: Clock = TokioClock> {
    config: DispatcherConfig,
    link: Mutex<Link<T>>,
    clock: C,
}

impl<T: Transport> NotificationDispatcher<T, TokioClock> {
    /// Creates a dispatcher that waits out backoff on the tokio timer.
    pub fn new(config: DispatcherConfig, transport: T) -> Self {
        Self::with_clock(config, transport, TokioClock)
    }
}

impl<T: Transport, C: Clock> NotificationDispatcher<T, C> {
    pub fn with_clock(config: DispatcherConfig, transport: T, clock: C) -> Self {
        Self {
            config,
            link: Mutex::new(Link {
                transport,
                in_flight: false,
            }),
            clock,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Builds a message addressed to the configured chat.
    pub fn message(&self, text: impl Into<String>) -> OutboundMessage {
        OutboundMessage::new(self.config.destination.clone(), text)
    }

    /// Sends a message, reporting only whether it was delivered.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), DeliveryError> {
        self.dispatch(&message).await.result.map(|_| ())
    }

    /// Sends a message and returns the record of every attempt.
    ///
    /// Invalid messages fail without touching the transport. Transport
    /// failures, timeouts, rate limiting and server errors are retried up to
    /// `max_attempts` times in total. An explicit rejection by the endpoint
    /// ends the dispatch immediately.
    pub async fn dispatch(&self, message: &OutboundMessage) -> Dispatch {
        if let Err(e) = self.validate(message) {
            return Dispatch::refused(e);
        }

        let request = SendMessageRequest {
            chat_id: message.destination().as_str(),
            text: message.text(),
            parse_mode: None,
        };
        let bytes = match wire::encode_send_message(
            &self.config.host,
            &self.config.bot_token,
            &request,
        ) {
            Ok(bytes) => bytes,
            Err(e) => return Dispatch::refused(ValidationError::Encoding(e.to_string())),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut number = 0;

        loop {
            number += 1;
            let started_at = Utc::now();
            let start = Instant::now();
            let result = self.attempt(&bytes).await;
            let elapsed = start.elapsed();

            let record = |outcome| DeliveryAttempt {
                number,
                started_at,
                elapsed,
                outcome,
            };

            match result {
                Ok(sent) => {
                    attempts.push(record(AttemptOutcome::Delivered));
                    return Dispatch {
                        attempts,
                        result: Ok(sent),
                    };
                }
                Err(AttemptFailure::Rejected { code, description }) => {
                    attempts.push(record(AttemptOutcome::Rejected(description.clone())));
                    return Dispatch {
                        attempts,
                        result: Err(DeliveryError::Rejected { code, description }),
                    };
                }
                Err(AttemptFailure::Transient { cause, retry_after }) => {
                    attempts.push(record(AttemptOutcome::Transient(cause.to_string())));
                    if number >= max_attempts {
                        return Dispatch {
                            attempts,
                            result: Err(DeliveryError::Transient {
                                attempts: number,
                                cause,
                            }),
                        };
                    }
                    let delay = self
                        .config
                        .backoff_after(number)
                        .max(retry_after.unwrap_or_default());
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    /// Closes the connection. A later send reopens it.
    pub async fn shutdown(&self) {
        let mut link = self.link.lock().await;
        link.transport.close().await;
        link.in_flight = false;
    }

    fn validate(&self, message: &OutboundMessage) -> Result<(), ValidationError> {
        if message.destination() != &self.config.destination {
            return Err(ValidationError::WrongDestination {
                expected: self.config.destination.clone(),
                got: message.destination().clone(),
            });
        }
        if message.text().trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        let len = message.text_len();
        if len > self.config.max_text_len {
            return Err(ValidationError::TooLong {
                len,
                max: self.config.max_text_len,
            });
        }
        Ok(())
    }

    async fn attempt(&self, request: &[u8]) -> Result<SentMessage, AttemptFailure> {
        let mut link = self.link.lock().await;
        if link.in_flight {
            link.transport.close().await;
        }
        link.in_flight = true;

        let exchanged = match timeout(
            self.config.attempt_timeout,
            exchange(&mut link.transport, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransientCause::Transport(TransportError::TimedOut)),
        };

        let response = match exchanged {
            Ok(response) => response,
            Err(cause) => {
                link.transport.close().await;
                link.in_flight = false;
                return Err(AttemptFailure::Transient {
                    cause,
                    retry_after: None,
                });
            }
        };

        let verdict = match wire::classify(&response) {
            Ok(ReplyVerdict::Delivered(sent)) => Ok(sent),
            Ok(ReplyVerdict::Retry {
                reason,
                retry_after,
            }) => Err(AttemptFailure::Transient {
                cause: TransientCause::Endpoint(reason),
                retry_after,
            }),
            Ok(ReplyVerdict::Rejected { code, description }) => {
                Err(AttemptFailure::Rejected { code, description })
            }
            Err(e) => Err(AttemptFailure::Transient {
                cause: TransientCause::Protocol(e),
                retry_after: None,
            }),
        };

        // Only a connection that just carried a sound exchange is reused.
        let reusable = !matches!(verdict, Err(AttemptFailure::Transient { .. }));
        if !reusable || !response.keep_alive() {
            link.transport.close().await;
        }
        link.in_flight = false;
        verdict
    }
}

/// Writes one request and reads exactly one response.
async fn exchange<T: Transport>(
    transport: &mut T,
    request: &[u8],
) -> Result<HttpResponse, TransientCause> {
    if !transport.is_open() {
        transport.open().await?;
    }
    transport.write(request).await?;

    let mut parser = ResponseParser::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut received = 0usize;
    loop {
        let n = transport.read(&mut buf).await?;
        if n == 0 {
            if received == 0 {
                return Err(TransportError::ConnectionClosed.into());
            }
            return Ok(parser.finish()?);
        }
        received += n;
        if let Some(response) = parser.feed(&buf[..n])? {
            return Ok(response);
        }
    }
}
