//! Retry, validation and serialization behaviour of the dispatcher.

mod helpers;

use helpers::{build, test_config, TEST_CHAT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trapnotify::test_utils::{error_reply, http_response, ok_reply, request_body, ScriptedTransport, Step};
use trapnotify::{
    AttemptOutcome, BackoffStrategy, DeliveryError, DispatcherConfig, OutboundMessage,
    TransientCause, ValidationError,
};

#[tokio::test]
async fn test_acknowledged_on_first_attempt() {
    // Arrange
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(42)));
    let (dispatcher, clock) = build(test_config(), &transport);

    // Act
    let dispatch = dispatcher.dispatch(&dispatcher.message("Motion detected")).await;

    // Assert
    let sent = dispatch.result.expect("delivery should succeed");
    assert_eq!(sent.message_id, Some(42));
    assert_eq!(dispatch.attempts.len(), 1);
    assert!(dispatch.attempts[0].succeeded());
    assert_eq!(transport.request_count(), 1);
    assert!(clock.sleeps().is_empty(), "no backoff on success");
}

#[tokio::test]
async fn test_request_carries_destination_and_text() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let (dispatcher, _clock) = build(test_config(), &transport);

    dispatcher
        .send(OutboundMessage::new(TEST_CHAT, "Trap closed at 03:12"))
        .await
        .unwrap();

    let requests = transport.requests();
    let head = String::from_utf8_lossy(&requests[0]);
    assert!(head.starts_with("POST /bot123456789:TEST-token-not-real/sendMessage HTTP/1.1"));
    let body = request_body(&requests[0]).unwrap();
    assert_eq!(body["chat_id"], TEST_CHAT);
    assert_eq!(body["text"], "Trap closed at 03:12");
}

#[tokio::test]
async fn test_oversized_message_is_refused_without_writes() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let (dispatcher, clock) = build(test_config(), &transport);
    let text = "x".repeat(4097);

    let dispatch = dispatcher.dispatch(&dispatcher.message(text)).await;

    match dispatch.result {
        Err(DeliveryError::Validation(ValidationError::TooLong { len, max })) => {
            assert_eq!(len, 4097);
            assert_eq!(max, 4096);
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
    assert!(dispatch.attempts.is_empty());
    assert_eq!(transport.request_count(), 0);
    assert_eq!(transport.opens(), 0);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_limit_counts_characters_not_bytes() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let config = DispatcherConfig {
        max_text_len: 4,
        ..test_config()
    };
    let (dispatcher, _clock) = build(config, &transport);

    // Four characters, twelve bytes.
    assert!(dispatcher.send(dispatcher.message("🐭🪤🧀✓")).await.is_ok());
    assert!(matches!(
        dispatcher.send(dispatcher.message("🐭🪤🧀✓!")).await,
        Err(DeliveryError::Validation(ValidationError::TooLong { len: 5, max: 4 }))
    ));
}

#[tokio::test]
async fn test_empty_and_misaddressed_messages_are_refused() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let (dispatcher, _clock) = build(test_config(), &transport);

    let empty = dispatcher.send(dispatcher.message("   ")).await;
    assert!(matches!(
        empty,
        Err(DeliveryError::Validation(ValidationError::EmptyText))
    ));

    let elsewhere = dispatcher
        .send(OutboundMessage::new("-100200300", "hello"))
        .await;
    assert!(matches!(
        elsewhere,
        Err(DeliveryError::Validation(ValidationError::WrongDestination { .. }))
    ));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_succeeds_on_third_attempt_after_timeouts() {
    // Arrange
    let transport = ScriptedTransport::new([
        Step::TimeOut,
        Step::TimeOut,
        Step::Reply(ok_reply(7)),
    ]);
    let (dispatcher, clock) = build(test_config(), &transport);

    // Act
    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    // Assert
    assert_eq!(dispatch.result.unwrap().message_id, Some(7));
    assert_eq!(dispatch.attempts.len(), 3);
    assert_eq!(transport.request_count(), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(1)]
    );
    let numbers: Vec<u32> = dispatch.attempts.iter().map(|a| a.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(matches!(dispatch.attempts[0].outcome, AttemptOutcome::Transient(_)));
}

#[tokio::test]
async fn test_recovers_from_connection_failures() {
    let transport = ScriptedTransport::new([
        Step::RefuseConnect,
        Step::ResetOnWrite,
        Step::Reply(ok_reply(9)),
    ]);
    let config = DispatcherConfig {
        max_attempts: 4,
        ..test_config()
    };
    let (dispatcher, clock) = build(config, &transport);

    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    assert!(dispatch.result.is_ok());
    assert_eq!(dispatch.attempts.len(), 3);
    // The refused connect never reached the wire.
    assert_eq!(transport.request_count(), 2);
    assert_eq!(clock.sleeps().len(), 2);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // Arrange
    let transport = ScriptedTransport::always(Step::TimeOut);
    let (dispatcher, clock) = build(test_config(), &transport);

    // Act
    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    // Assert
    match dispatch.result {
        Err(DeliveryError::Transient { attempts, cause }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(cause, TransientCause::Transport(_)));
        }
        other => panic!("expected a transient failure, got {:?}", other),
    }
    assert_eq!(transport.request_count(), 3, "never more than max_attempts");
    assert_eq!(dispatch.attempts.len(), 3);
    assert_eq!(clock.sleeps().len(), 2, "no backoff after the last attempt");
}

#[tokio::test]
async fn test_single_attempt_policy() {
    let transport = ScriptedTransport::always(Step::CloseEarly);
    let config = DispatcherConfig {
        max_attempts: 1,
        ..test_config()
    };
    let (dispatcher, clock) = build(config, &transport);

    let result = dispatcher.send(dispatcher.message("hello")).await;

    assert!(matches!(
        result,
        Err(DeliveryError::Transient { attempts: 1, .. })
    ));
    assert_eq!(transport.request_count(), 1);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    // Arrange
    let transport = ScriptedTransport::always(Step::Reply(error_reply(
        400,
        "Bad Request: chat not found",
    )));
    let (dispatcher, clock) = build(test_config(), &transport);

    // Act
    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    // Assert
    match dispatch.result {
        Err(DeliveryError::Rejected { code, description }) => {
            assert_eq!(code, Some(400));
            assert_eq!(description, "Bad Request: chat not found");
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(transport.request_count(), 1);
    assert_eq!(dispatch.attempts.len(), 1);
    assert_eq!(
        dispatch.attempts[0].failure_reason(),
        Some("Bad Request: chat not found")
    );
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_unauthorized_token_is_rejected() {
    let transport = ScriptedTransport::always(Step::Reply(error_reply(401, "Unauthorized")));
    let (dispatcher, _clock) = build(test_config(), &transport);

    let result = dispatcher.send(dispatcher.message("hello")).await;

    assert!(matches!(
        result,
        Err(DeliveryError::Rejected { code: Some(401), .. })
    ));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_rate_limit_waits_at_least_retry_after() {
    let throttled = http_response(
        429,
        r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 5","parameters":{"retry_after":5}}"#,
    );
    let transport = ScriptedTransport::new([Step::Reply(throttled), Step::Reply(ok_reply(3))]);
    let (dispatcher, clock) = build(test_config(), &transport);

    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    assert!(dispatch.result.is_ok());
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let transport = ScriptedTransport::new([
        Step::Reply(http_response(502, "<html>Bad Gateway</html>")),
        Step::Reply(ok_reply(3)),
    ]);
    let (dispatcher, _clock) = build(test_config(), &transport);

    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    assert!(dispatch.result.is_ok());
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn test_garbage_response_is_retried_on_fresh_connection() {
    let transport = ScriptedTransport::new([
        Step::Reply(b"SSH-2.0-OpenSSH_9.6\r\n\r\n".to_vec()),
        Step::Reply(ok_reply(3)),
    ]);
    let (dispatcher, _clock) = build(test_config(), &transport);

    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    assert!(dispatch.result.is_ok());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn test_oversized_chunk_from_endpoint_is_transient() {
    let hostile = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\nffffffffffffffff\r\nxx\r\n".to_vec();
    let transport = ScriptedTransport::always(Step::Reply(hostile));
    let (dispatcher, _clock) = build(test_config(), &transport);

    let result = dispatcher.send(dispatcher.message("hello")).await;

    match result {
        Err(DeliveryError::Transient { attempts, cause }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(cause, TransientCause::Protocol(_)));
        }
        other => panic!("expected a protocol failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retryable_replies_discard_the_connection() {
    // Arrange
    let transport = ScriptedTransport::new([
        Step::Reply(http_response(200, "not json")),
        Step::Reply(http_response(503, "busy")),
        Step::Reply(ok_reply(4)),
    ]);
    let (dispatcher, _clock) = build(test_config(), &transport);

    // Act
    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    // Assert
    assert_eq!(dispatch.result.unwrap().message_id, Some(4));
    assert_eq!(dispatch.attempts.len(), 3);
    assert_eq!(transport.opens(), 3, "every retry starts on a fresh connection");
    assert_eq!(transport.closes(), 2);
}

#[tokio::test]
async fn test_rejection_keeps_the_connection() {
    let transport = ScriptedTransport::new([
        Step::Reply(error_reply(400, "Bad Request: message text is empty")),
        Step::Reply(ok_reply(2)),
    ]);
    let (dispatcher, _clock) = build(test_config(), &transport);

    assert!(dispatcher.send(dispatcher.message("one")).await.is_err());
    assert!(dispatcher.send(dispatcher.message("two")).await.is_ok());

    assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn test_exponential_backoff_doubles_between_attempts() {
    let transport = ScriptedTransport::always(Step::TimeOut);
    let config = DispatcherConfig {
        max_attempts: 4,
        backoff: Duration::from_millis(250),
        backoff_strategy: BackoffStrategy::Exponential,
        ..test_config()
    };
    let (dispatcher, clock) = build(config, &transport);

    let _ = dispatcher.send(dispatcher.message("hello")).await;

    assert_eq!(
        clock.sleeps(),
        vec![
            Duration::from_millis(250),
            Duration::from_millis(500),
            Duration::from_millis(1000),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_endpoint_hits_attempt_timeout() {
    let transport = ScriptedTransport::new([Step::Hang, Step::Reply(ok_reply(5))]);
    let (dispatcher, _clock) = build(test_config(), &transport);

    let dispatch = dispatcher.dispatch(&dispatcher.message("hello")).await;

    assert!(dispatch.result.is_ok());
    assert_eq!(dispatch.attempts.len(), 2);
    let reason = dispatch.attempts[0].failure_reason().unwrap();
    assert!(reason.contains("timed out"), "unexpected reason: {}", reason);
    assert!(dispatch.attempts[0].elapsed >= Duration::from_millis(500));
    // The hung connection is dropped and a new one opened.
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn test_connection_is_reused_between_sends() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let (dispatcher, _clock) = build(test_config(), &transport);

    for _ in 0..3 {
        dispatcher.send(dispatcher.message("hello")).await.unwrap();
    }

    assert_eq!(transport.opens(), 1);
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_connection_close_reply_reconnects() {
    let body = r#"{"ok":true,"result":{"message_id":1}}"#;
    let reply = format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let transport = ScriptedTransport::always(Step::Reply(reply.into_bytes()));
    let (dispatcher, _clock) = build(test_config(), &transport);

    dispatcher.send(dispatcher.message("one")).await.unwrap();
    dispatcher.send(dispatcher.message("two")).await.unwrap();

    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let transport = ScriptedTransport::always(Step::Reply(ok_reply(1)));
    let (dispatcher, _clock) = build(test_config(), &transport);

    dispatcher.send(dispatcher.message("hello")).await.unwrap();
    dispatcher.shutdown().await;

    assert_eq!(transport.closes(), 1);
    assert!(dispatcher.send(dispatcher.message("again")).await.is_ok());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_never_interleave() {
    // Arrange
    const CALLERS: usize = 32;
    let transport = ScriptedTransport::always(Step::Echo).with_chunk_size(7);
    let (dispatcher, _clock) = build(test_config(), &transport);
    let dispatcher = Arc::new(dispatcher);

    // Act
    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let text = format!("caller {} reporting", i);
                let sent = dispatcher
                    .dispatch(&dispatcher.message(text.clone()))
                    .await
                    .result
                    .expect("echo transport always acknowledges");
                (text, sent.message_id.expect("echo assigns ids"))
            })
        })
        .collect();
    let results: Vec<(String, i64)> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    // Assert
    assert_eq!(transport.interleavings(), 0);
    assert_eq!(transport.request_count(), CALLERS);

    // Every caller got the id assigned to its own request.
    let delivered: HashMap<i64, String> = transport.delivered().into_iter().collect();
    assert_eq!(delivered.len(), CALLERS);
    for (text, message_id) in results {
        assert_eq!(delivered.get(&message_id), Some(&text));
    }
}
