//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::time::Duration;
use trapnotify::test_utils::{RecordingClock, ScriptedTransport};
use trapnotify::{DispatcherConfig, NotificationDispatcher};

pub const TEST_TOKEN: &str = "123456789:TEST-token-not-real";
pub const TEST_CHAT: &str = "1007315026";

/// A dispatcher configuration with short, test-friendly timings.
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        max_attempts: 3,
        attempt_timeout: Duration::from_millis(500),
        backoff: Duration::from_secs(1),
        ..DispatcherConfig::new("api.telegram.org", TEST_TOKEN, TEST_CHAT)
    }
}

pub type TestDispatcher = NotificationDispatcher<ScriptedTransport, RecordingClock>;

/// Builds a dispatcher over `transport`, returning handles for inspection.
pub fn build(
    config: DispatcherConfig,
    transport: &ScriptedTransport,
) -> (TestDispatcher, RecordingClock) {
    let clock = RecordingClock::new();
    let dispatcher = NotificationDispatcher::with_clock(config, transport.clone(), clock.clone());
    (dispatcher, clock)
}
