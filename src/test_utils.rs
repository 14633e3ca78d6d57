//! Scripted collaborators for exercising the dispatcher without a network.

use crate::core::{Clock, Transport};
use crate::transport::TransportError;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the transport does for one request/response exchange.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with these raw HTTP bytes.
    Reply(Vec<u8>),
    /// Acknowledge the request, echoing its text and assigning a message id.
    Echo,
    /// Fail to connect. Only takes effect when the transport is closed.
    RefuseConnect,
    /// Fail while writing the request.
    ResetOnWrite,
    /// Fail the first read with a timeout.
    TimeOut,
    /// Never answer.
    Hang,
    /// Close the connection without answering.
    CloseEarly,
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<Step>,
    fallback: Option<Step>,
    open: bool,
    opens: u32,
    closes: u32,
    requests: Vec<Vec<u8>>,
    current: Option<Step>,
    pending: VecDeque<u8>,
    awaiting_response: bool,
    interleaved: u32,
    next_message_id: i64,
    delivered: Vec<(i64, String)>,
}

impl ScriptState {
    fn next_step(&mut self) -> Step {
        self.steps
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or(Step::TimeOut)
    }

    fn echo(&mut self, request: &[u8]) -> Vec<u8> {
        let body = request_body(request).unwrap_or(serde_json::Value::Null);
        let text = body["text"].as_str().unwrap_or_default().to_string();
        let chat_id = body["chat_id"]
            .as_str()
            .and_then(|id| id.parse::<i64>().ok())
            .unwrap_or_default();

        self.next_message_id += 1;
        let message_id = self.next_message_id;
        self.delivered.push((message_id, text.clone()));

        let reply = json!({
            "ok": true,
            "result": {
                "message_id": message_id,
                "chat": { "id": chat_id, "type": "private" },
                "text": text,
            }
        });
        http_response(200, &reply.to_string())
    }
}

/// A `Transport` that plays back a script of exchanges.
///
/// Clones share state, so a test can keep one clone as a handle for
/// inspecting traffic after handing the other to a dispatcher. Once the
/// script runs out the fallback step is used, or `Step::TimeOut` if none
/// was set.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    chunk_size: usize,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let state = ScriptState {
            steps: steps.into_iter().collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            chunk_size: 64,
        }
    }

    /// A transport that performs `step` for every exchange.
    pub fn always(step: Step) -> Self {
        Self::new([]).with_fallback(step)
    }

    pub fn with_fallback(self, step: Step) -> Self {
        self.state.lock().unwrap().fallback = Some(step);
        self
    }

    /// Limits how many bytes a single read returns.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Number of requests written, one per attempt that reached the wire.
    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }

    /// Times a request was written while a previous response was unread.
    pub fn interleavings(&self) -> u32 {
        self.state.lock().unwrap().interleaved
    }

    /// `(message_id, text)` for every request answered by `Step::Echo`.
    pub fn delivered(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().delivered.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if matches!(state.steps.front(), Some(Step::RefuseConnect)) {
            state.steps.pop_front();
            return Err(TransportError::Connect {
                host: "scripted".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if state.awaiting_response {
                state.interleaved += 1;
            }
            state.requests.push(buf.to_vec());

            let step = state.next_step();
            match &step {
                Step::ResetOnWrite | Step::RefuseConnect => {
                    state.open = false;
                    return Err(TransportError::ConnectionClosed);
                }
                Step::Reply(bytes) => state.pending = bytes.iter().copied().collect(),
                Step::Echo => state.pending = state.echo(buf).into_iter().collect(),
                Step::TimeOut | Step::Hang | Step::CloseEarly => state.pending.clear(),
            }
            state.current = Some(step);
            state.awaiting_response = true;
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        tokio::task::yield_now().await;

        let hang = {
            let mut state = self.state.lock().unwrap();
            match state.current.clone() {
                Some(Step::Reply(_)) | Some(Step::Echo) => {
                    let n = self.chunk_size.min(buf.len()).min(state.pending.len());
                    for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
                        *slot = byte;
                    }
                    if state.pending.is_empty() {
                        state.awaiting_response = false;
                    }
                    return Ok(n);
                }
                Some(Step::TimeOut) => {
                    state.awaiting_response = false;
                    return Err(TransportError::TimedOut);
                }
                Some(Step::CloseEarly) => {
                    state.awaiting_response = false;
                    state.open = false;
                    return Ok(0);
                }
                Some(Step::Hang) => true,
                _ => return Ok(0),
            }
        };

        if hang {
            std::future::pending::<()>().await;
        }
        Ok(0)
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.open {
            state.closes += 1;
        }
        state.open = false;
        state.pending.clear();
        state.current = None;
        state.awaiting_response = false;
    }
}

/// A `Clock` that records requested delays and returns at once.
#[derive(Debug, Clone, Default)]
pub struct RecordingClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Builds a raw HTTP/1.1 response with a JSON body.
pub fn http_response(status: u16, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// An `"ok": true` reply carrying `message_id`.
pub fn ok_reply(message_id: i64) -> Vec<u8> {
    let body = json!({
        "ok": true,
        "result": { "message_id": message_id, "chat": { "id": 1, "type": "private" } }
    });
    http_response(200, &body.to_string())
}

/// An `"ok": false` reply as the Bot API sends it.
pub fn error_reply(status: u16, description: &str) -> Vec<u8> {
    let body = json!({
        "ok": false,
        "error_code": status,
        "description": description,
    });
    http_response(status, &body.to_string())
}

/// Extracts the JSON body of a request written by the dispatcher.
pub fn request_body(request: &[u8]) -> Option<serde_json::Value> {
    let split = request.windows(4).position(|w| w == b"\r\n\r\n")?;
    serde_json::from_slice(&request[split + 4..]).ok()
}
