//! Wire codec for the Telegram Bot API `sendMessage` call.
//!
//! Requests are HTTP/1.1 `POST`s with a JSON body. Responses are parsed
//! incrementally so the dispatcher can stop reading as soon as one complete
//! response has arrived, which keeps the connection reusable.

use crate::core::SentMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the size of a response head (status line and headers).
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Upper bound on the size of a response body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const USER_AGENT: &str = concat!("trapnotify/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum WireError {
    #[error("response head exceeds the size limit")]
    HeaderTooLarge,

    #[error("response body exceeds the size limit")]
    BodyTooLarge,

    #[error("malformed response head: {0}")]
    MalformedHead(#[from] httparse::Error),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed chunked encoding: {0}")]
    BadChunk(String),

    #[error("connection closed before the response was complete")]
    Incomplete,

    #[error("response body is not a valid API reply: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

/// JSON body of a `sendMessage` request.
#[derive(Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    pub chat_id: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<&'a str>,
}

/// Encodes a complete `sendMessage` HTTP request.
///
/// # Arguments
/// * `host` - Value for the `Host` header
/// * `token` - Bot token; it becomes part of the request path
/// * `request` - The message payload
pub fn encode_send_message(
    host: &str,
    token: &str,
    request: &SendMessageRequest<'_>,
) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(request).map_err(WireError::Encode)?;
    let head = format!(
        "POST /bot{token}/sendMessage HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: application/json\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// A fully received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// True for HTTP/1.1, false for HTTP/1.0.
    pub http11: bool,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the connection may carry another request after this response.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(str::to_ascii_lowercase);
        match connection.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.http11,
        }
    }
}

/// Most headers a response head may carry.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
struct Head {
    status: u16,
    http11: bool,
    headers: Vec<(String, String)>,
    framing: Framing,
    body_start: usize,
}

/// Incremental HTTP/1.x response parser.
#[derive(Debug, Default)]
pub struct ResponseParser {
    buf: Vec<u8>,
    head: Option<Head>,
    chunked: ChunkedBody,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the transport.
    ///
    /// # Returns
    /// * `Ok(Some(response))` once a complete response has been received
    /// * `Ok(None)` if more bytes are needed
    /// * `Err` if the bytes cannot be a valid response
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpResponse>, WireError> {
        self.buf.extend_from_slice(data);

        while self.head.is_none() {
            let Some(head) = parse_head(&self.buf)? else {
                return Ok(None);
            };
            // Interim 1xx responses carry no body; skip them.
            if (100..200).contains(&head.status) {
                self.buf.drain(..head.body_start);
                continue;
            }
            self.head = Some(head);
        }

        let Some(head) = &self.head else {
            return Ok(None);
        };
        let body = &self.buf[head.body_start..];

        let complete = match head.framing {
            Framing::Length(len) => {
                if len > MAX_BODY_BYTES {
                    return Err(WireError::BodyTooLarge);
                }
                if body.len() >= len {
                    Some(body[..len].to_vec())
                } else {
                    None
                }
            }
            Framing::Chunked => {
                if self.chunked.advance(body)? {
                    Some(std::mem::take(&mut self.chunked.body))
                } else {
                    None
                }
            }
            Framing::UntilClose => {
                if body.len() > MAX_BODY_BYTES {
                    return Err(WireError::BodyTooLarge);
                }
                None
            }
        };

        match (complete, self.head.take()) {
            (Some(body), Some(head)) => Ok(Some(self.build(head, body))),
            (None, head) => {
                self.head = head;
                Ok(None)
            }
            (Some(_), None) => Ok(None),
        }
    }

    /// Completes the response when the peer closes the connection.
    ///
    /// Only responses without explicit framing may end this way.
    pub fn finish(&mut self) -> Result<HttpResponse, WireError> {
        match self.head.take() {
            Some(head) if head.framing == Framing::UntilClose => {
                let body = self.buf[head.body_start..].to_vec();
                Ok(self.build(head, body))
            }
            _ => Err(WireError::Incomplete),
        }
    }

    fn build(&mut self, head: Head, body: Vec<u8>) -> HttpResponse {
        self.buf.clear();
        self.chunked = ChunkedBody::default();
        HttpResponse {
            status: head.status,
            http11: head.http11,
            headers: head.headers,
            body,
        }
    }
}

/// Parses the status line and headers at the start of `buf`.
///
/// Returns `Ok(None)` until the blank line ending the head has arrived.
fn parse_head(buf: &[u8]) -> Result<Option<Head>, WireError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let body_start = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_BYTES {
                return Err(WireError::HeaderTooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(WireError::HeaderTooLarge),
        Err(e) => return Err(e.into()),
    };
    if body_start > MAX_HEADER_BYTES {
        return Err(WireError::HeaderTooLarge);
    }

    let status = response.code.unwrap_or_default();
    let http11 = response.version == Some(1);
    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_ascii_lowercase())
    };

    let framing = if header("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
        Framing::Chunked
    } else if let Some(len) = header("content-length") {
        let len = len
            .parse::<usize>()
            .map_err(|_| WireError::MalformedHeader(format!("Content-Length: {}", len)))?;
        Framing::Length(len)
    } else if status == 204 || status == 304 || (100..200).contains(&status) {
        Framing::Length(0)
    } else {
        Framing::UntilClose
    };

    Ok(Some(Head {
        status,
        http11,
        headers,
        framing,
        body_start,
    }))
}

/// Decoding state of a chunked body, kept across feeds so each chunk is
/// consumed once.
#[derive(Debug, Default)]
struct ChunkedBody {
    /// Offset into the body bytes of the next unread chunk.
    pos: usize,
    body: Vec<u8>,
}

impl ChunkedBody {
    /// Consumes every complete chunk in `data`, the body bytes received so
    /// far. Returns true once the terminating chunk and trailers are in.
    fn advance(&mut self, data: &[u8]) -> Result<bool, WireError> {
        loop {
            let rest = &data[self.pos..];
            let (size_len, size) = match httparse::parse_chunk_size(rest) {
                Ok(httparse::Status::Complete(parsed)) => parsed,
                Ok(httparse::Status::Partial) => return Ok(false),
                Err(_) => return Err(WireError::BadChunk("invalid chunk size".to_string())),
            };

            if size == 0 {
                // Trailers run up to an empty line.
                let mut at = size_len;
                loop {
                    let Some(end) = find(rest, b"\r\n", at) else {
                        return Ok(false);
                    };
                    if end == at {
                        return Ok(true);
                    }
                    at = end + 2;
                }
            }

            // The body never exceeds MAX_BODY_BYTES, so the subtraction holds
            // and a size that passes this check is small.
            let room = (MAX_BODY_BYTES - self.body.len()) as u64;
            if size > room {
                return Err(WireError::BodyTooLarge);
            }
            let size = size as usize;
            let chunk_end = size_len + size;
            if rest.len() < chunk_end + 2 {
                return Ok(false);
            }
            if &rest[chunk_end..chunk_end + 2] != b"\r\n" {
                return Err(WireError::BadChunk("chunk not terminated by CRLF".to_string()));
            }
            self.body.extend_from_slice(&rest[size_len..chunk_end]);
            self.pos += chunk_end + 2;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

// =============================================================================
// Bot API reply
// =============================================================================

/// The envelope every Bot API method replies with.
#[derive(Debug, Deserialize)]
pub struct ApiReply {
    pub ok: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
    #[serde(default)]
    pub result: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    pub message_id: i64,
    #[serde(default)]
    pub chat: Option<ApiChat>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChat {
    pub id: i64,
}

/// What the dispatcher should do with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyVerdict {
    Delivered(SentMessage),
    /// Worth retrying. `retry_after` is the server's requested minimum wait.
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    Rejected {
        code: Option<i64>,
        description: String,
    },
}

/// Interprets an HTTP response to a `sendMessage` request.
///
/// Rate limiting (429) and server errors (5xx) are retryable; any other
/// `"ok": false` reply is a rejection. A 2xx response whose body is not a
/// Bot API reply is a protocol error.
pub fn classify(response: &HttpResponse) -> Result<ReplyVerdict, WireError> {
    let status = response.status;
    let retryable_status = status == 429 || status >= 500;

    let reply: ApiReply = match serde_json::from_slice(&response.body) {
        Ok(reply) => reply,
        Err(_) if retryable_status => {
            return Ok(ReplyVerdict::Retry {
                reason: format!("HTTP {}", status),
                retry_after: None,
            })
        }
        Err(_) if status >= 400 => {
            return Ok(ReplyVerdict::Rejected {
                code: Some(i64::from(status)),
                description: format!("HTTP {} without an API reply", status),
            })
        }
        Err(e) => return Err(WireError::InvalidBody(e)),
    };

    if reply.ok {
        let sent = match reply.result {
            Some(message) => SentMessage {
                message_id: Some(message.message_id),
                chat_id: message.chat.map(|chat| chat.id),
            },
            None => SentMessage {
                message_id: None,
                chat_id: None,
            },
        };
        return Ok(ReplyVerdict::Delivered(sent));
    }

    let code = reply.error_code.or(Some(i64::from(status)));
    let description = reply
        .description
        .unwrap_or_else(|| format!("HTTP {}", status));

    if retryable_status || code == Some(429) || code.is_some_and(|c| c >= 500) {
        let retry_after = reply
            .parameters
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs);
        return Ok(ReplyVerdict::Retry {
            reason: description,
            retry_after,
        });
    }

    Ok(ReplyVerdict::Rejected { code, description })
}
