/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Coordinator tests against mock collaborators.
//!
//! Time is paused, so grace periods and close delays are deterministic
//! virtual time rather than wall-clock sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_terminator::{
    BoxError, Connection, ConnectionId, Listener, Outcome, OutcomeCode, OutstandingResponse, ServerEvent, Terminator,
    TerminatorBuilder, TransportKind,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

#[derive(Default)]
struct MockResponse {
    headers_sent: AtomicBool,
    close_requested: AtomicBool,
}

impl MockResponse {
    fn pending_headers() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn headers_already_sent() -> Arc<Self> {
        let response = Self::default();
        response.headers_sent.store(true, Ordering::SeqCst);
        Arc::new(response)
    }

    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

impl OutstandingResponse for MockResponse {
    fn headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::SeqCst)
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }
}

struct MockConnection {
    id: ConnectionId,
    kind: TransportKind,
    outstanding: Mutex<Option<Arc<MockResponse>>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn idle(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            kind,
            outstanding: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn with_response(kind: TransportKind, response: Arc<MockResponse>) -> Arc<Self> {
        let connection = Self::idle(kind);
        *connection.outstanding.lock().unwrap() = Some(response);
        connection
    }

    fn force_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn outstanding_response(&self) -> Option<Arc<dyn OutstandingResponse>> {
        self.outstanding
            .lock()
            .unwrap()
            .clone()
            .map(|response| response as Arc<dyn OutstandingResponse>)
    }

    fn force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum CloseBehavior {
    Immediate,
    AfterMillis(u64),
    ErrorAfterMillis(u64),
    Panic,
}

struct MockListener {
    events: Mutex<Option<UnboundedReceiver<ServerEvent>>>,
    close_behavior: CloseBehavior,
    close_completed: Arc<AtomicBool>,
}

struct MockHandle {
    events: UnboundedSender<ServerEvent>,
    close_completed: Arc<AtomicBool>,
}

impl MockHandle {
    fn accepted(&self, connection: &Arc<MockConnection>) {
        let connection: Arc<dyn Connection> = connection.clone();
        self.events
            .send(ServerEvent::ConnectionAccepted(connection))
            .expect("event pump is running");
    }

    fn closed(&self, id: ConnectionId) {
        self.events
            .send(ServerEvent::ConnectionClosed(id))
            .expect("event pump is running");
    }

    fn request_received(&self, response: &Arc<MockResponse>) {
        let response: Arc<dyn OutstandingResponse> = response.clone();
        self.events
            .send(ServerEvent::RequestReceived(response))
            .expect("event pump is running");
    }
}

fn mock_listener(close_behavior: CloseBehavior) -> (MockListener, MockHandle) {
    let (events, receiver) = mpsc::unbounded_channel();
    let close_completed = Arc::new(AtomicBool::new(false));
    let listener = MockListener {
        events: Mutex::new(Some(receiver)),
        close_behavior,
        close_completed: Arc::clone(&close_completed),
    };
    let handle = MockHandle {
        events,
        close_completed,
    };
    (listener, handle)
}

impl Listener for MockListener {
    fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        self.events
            .lock()
            .unwrap()
            .take()
            .expect("subscribe is called exactly once")
    }

    fn close(&self) -> BoxFuture<'static, Result<(), BoxError>> {
        let behavior = self.close_behavior;
        let completed = Arc::clone(&self.close_completed);
        async move {
            match behavior {
                CloseBehavior::Immediate => {
                    completed.store(true, Ordering::SeqCst);
                    Ok(())
                }
                CloseBehavior::AfterMillis(delay) => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    completed.store(true, Ordering::SeqCst);
                    Ok(())
                }
                CloseBehavior::ErrorAfterMillis(delay) => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    completed.store(true, Ordering::SeqCst);
                    Err("cannot close the listener".into())
                }
                CloseBehavior::Panic => panic!("close exploded"),
            }
        }
        .boxed()
    }
}

/// Lets the event pump drain everything queued so far.
async fn drain_events() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn terminates_with_no_connections() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = Terminator::new(listener);

    let outcome = terminator.terminate().await;

    assert_eq!(
        outcome,
        Outcome {
            success: true,
            code: OutcomeCode::Terminated,
        }
    );
    assert!(handle.close_completed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn returns_timed_out_when_close_outlasts_the_wait() {
    let (listener, handle) = mock_listener(CloseBehavior::AfterMillis(400));
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(100))
        .max_wait_for_close(Duration::from_millis(300))
        .build(listener);

    let outcome = terminator.terminate().await;

    assert_eq!(
        outcome,
        Outcome {
            success: false,
            code: OutcomeCode::TimedOut,
        }
    );

    // Losing the race must not cancel the close itself.
    assert!(!handle.close_completed.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.close_completed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn returns_server_error_when_close_reports_an_error() {
    let (listener, _handle) = mock_listener(CloseBehavior::ErrorAfterMillis(400));
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(10))
        .build(listener);

    let outcome = terminator.terminate().await;

    assert_eq!(
        outcome,
        Outcome {
            success: false,
            code: OutcomeCode::ServerError,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn returns_server_error_when_close_fails_within_the_wait() {
    let (listener, _handle) = mock_listener(CloseBehavior::ErrorAfterMillis(100));
    let terminator = TerminatorBuilder::new()
        .max_wait_for_close(Duration::from_millis(300))
        .build(listener);

    let outcome = terminator.terminate().await;

    assert_eq!(outcome.code, OutcomeCode::ServerError);
    assert!(!outcome.success);
}

#[tokio::test(start_paused = true)]
async fn returns_internal_error_when_close_panics() {
    let (listener, _handle) = mock_listener(CloseBehavior::Panic);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(10))
        .build(listener);

    let outcome = terminator.terminate().await;

    assert_eq!(
        outcome,
        Outcome {
            success: false,
            code: OutcomeCode::InternalError,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_closed_before_any_grace_wait() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(150))
        .build(listener);

    let idle = MockConnection::idle(TransportKind::Plain);
    handle.accepted(&idle);
    drain_events().await;
    assert_eq!(terminator.tracked_connections(TransportKind::Plain), 1);

    let started = Instant::now();
    let outcome = terminator.terminate().await;

    assert!(outcome.success);
    assert!(idle.force_closed());
    assert_eq!(terminator.tracked_connections(TransportKind::Plain), 0);
    // Reclaimed in the synchronous sweep; no grace period was served.
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn marked_inflight_connection_is_left_to_complete_naturally() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(150))
        .build(listener);

    let response = MockResponse::pending_headers();
    let connection = MockConnection::with_response(TransportKind::Plain, Arc::clone(&response));
    handle.accepted(&connection);
    drain_events().await;

    let termination = tokio::spawn(terminator.terminate());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(response.close_requested());
    assert!(!connection.force_closed());

    // The exchange completes on its own before the grace deadline.
    handle.closed(connection.id());
    drain_events().await;

    let outcome = termination.await.unwrap();
    assert!(outcome.success);
    assert!(!connection.force_closed());
}

#[tokio::test(start_paused = true)]
async fn unmarkable_connection_is_reaped_at_the_grace_deadline() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(150))
        .build(listener);

    let response = MockResponse::headers_already_sent();
    let connection = MockConnection::with_response(TransportKind::Plain, Arc::clone(&response));
    handle.accepted(&connection);
    drain_events().await;

    let started = Instant::now();
    let termination = tokio::spawn(terminator.terminate());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!connection.force_closed());
    // The directive window is gone; the response must not be touched.
    assert!(!response.close_requested());

    let outcome = termination.await.unwrap();
    assert!(outcome.success);
    assert!(connection.force_closed());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed <= Duration::from_millis(170));
}

#[tokio::test(start_paused = true)]
async fn transport_kinds_are_swept_sequentially() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(100))
        .build(listener);

    let plain = MockConnection::with_response(TransportKind::Plain, MockResponse::headers_already_sent());
    let encrypted = MockConnection::with_response(TransportKind::Encrypted, MockResponse::headers_already_sent());
    handle.accepted(&plain);
    handle.accepted(&encrypted);
    drain_events().await;

    let started = Instant::now();
    let termination = tokio::spawn(terminator.terminate());

    // Between the two grace waits: plain is reaped, encrypted is not.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(plain.force_closed());
    assert!(!encrypted.force_closed());

    let outcome = termination.await.unwrap();
    assert!(outcome.success);
    assert!(encrypted.force_closed());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn connections_accepted_during_termination_are_destroyed() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(150))
        .build(listener);

    let straggler = MockConnection::with_response(TransportKind::Plain, MockResponse::headers_already_sent());
    handle.accepted(&straggler);
    drain_events().await;

    let termination = tokio::spawn(terminator.terminate());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let late = MockConnection::idle(TransportKind::Plain);
    handle.accepted(&late);
    drain_events().await;

    assert!(late.force_closed());
    assert_eq!(terminator.tracked_connections(TransportKind::Plain), 1);

    let outcome = termination.await.unwrap();
    assert!(outcome.success);
}

#[tokio::test(start_paused = true)]
async fn requests_received_during_termination_are_marked_close() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(150))
        .build(listener);

    let straggler = MockConnection::with_response(TransportKind::Plain, MockResponse::headers_already_sent());
    handle.accepted(&straggler);
    drain_events().await;

    let termination = tokio::spawn(terminator.terminate());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let fresh = MockResponse::pending_headers();
    handle.request_received(&fresh);
    let flushed = MockResponse::headers_already_sent();
    handle.request_received(&flushed);
    drain_events().await;

    assert!(fresh.close_requested());
    assert!(!flushed.close_requested());

    termination.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn requests_received_before_termination_are_not_marked() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = Terminator::new(listener);

    let response = MockResponse::pending_headers();
    handle.request_received(&response);
    drain_events().await;

    assert!(!terminator.is_terminating());
    assert!(!response.close_requested());
}

#[tokio::test(start_paused = true)]
async fn closed_connections_leave_the_registry() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = Terminator::new(listener);

    let connection = MockConnection::idle(TransportKind::Encrypted);
    handle.accepted(&connection);
    drain_events().await;
    assert_eq!(terminator.tracked_connections(TransportKind::Encrypted), 1);

    handle.closed(connection.id());
    drain_events().await;
    assert_eq!(terminator.tracked_connections(TransportKind::Encrypted), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_terminate_joins_the_inflight_sequence() {
    let (listener, handle) = mock_listener(CloseBehavior::Immediate);
    let terminator = TerminatorBuilder::new()
        .graceful_termination_timeout(Duration::from_millis(100))
        .build(listener);

    // Keep the sequence alive long enough for the second caller to join.
    let straggler = MockConnection::with_response(TransportKind::Plain, MockResponse::headers_already_sent());
    handle.accepted(&straggler);
    drain_events().await;

    let first = terminator.terminate();
    let second = terminator.terminate();
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first, second);
    assert!(first.success);

    // A caller arriving after completion still observes the same outcome.
    let third = terminator.terminate().await;
    assert_eq!(first, third);
}
