/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The termination coordinator.
//!
//! A [`Terminator`] watches the connections of a single [`Listener`] and, on
//! request, retires the listener without abruptly severing in-flight
//! exchanges:
//!
//! 1. New connections are rejected from the moment termination starts.
//! 2. In-flight responses that have not flushed headers are marked so the
//!    connection closes once the exchange completes; idle connections are
//!    reclaimed immediately.
//! 3. Each transport kind gets a bounded grace period, after which any
//!    connection still open is forcibly closed.
//! 4. The listener itself is closed, optionally raced against an overall
//!    timeout, and a single [`Outcome`] is reported to every caller.
//!
//! ```rust,ignore
//! let server = http_terminator::serve::serve(listener, service);
//! let terminator = TerminatorBuilder::new()
//!     .graceful_termination_timeout(Duration::from_secs(5))
//!     .build(server);
//!
//! // ... later, e.g. on SIGTERM:
//! let outcome = terminator.terminate().await;
//! assert!(outcome.success);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{ready, BoxFuture, Either, Shared};
use futures_util::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::connection::{Connection, ConnectionId, TransportKind};
use crate::listener::{Listener, ServerEvent};
use crate::outcome::{Outcome, OutcomeCode};

/// Grace period granted to in-flight exchanges when none is configured.
pub const DEFAULT_GRACEFUL_TERMINATION_TIMEOUT: Duration = Duration::from_millis(1000);

type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

/// Configures and builds a [`Terminator`].
#[derive(Debug, Clone)]
pub struct TerminatorBuilder {
    graceful_termination_timeout: Duration,
    max_wait_for_close: Option<Duration>,
}

impl Default for TerminatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminatorBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            graceful_termination_timeout: DEFAULT_GRACEFUL_TERMINATION_TIMEOUT,
            max_wait_for_close: None,
        }
    }

    /// How long in-flight exchanges are given to complete voluntarily before
    /// their connections are forcibly closed. Defaults to
    /// [`DEFAULT_GRACEFUL_TERMINATION_TIMEOUT`].
    pub fn graceful_termination_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_termination_timeout = timeout;
        self
    }

    /// Upper bound on how long to wait for the listener itself to finish
    /// closing. When unset, the terminator waits indefinitely.
    ///
    /// If the bound elapses first, the outcome is
    /// [`TIMED_OUT`](OutcomeCode::TimedOut); the close itself is left
    /// running and is not cancelled.
    pub fn max_wait_for_close(mut self, timeout: Duration) -> Self {
        self.max_wait_for_close = Some(timeout);
        self
    }

    /// Attach the coordinator to `listener`.
    ///
    /// Subscribes to the listener's event stream and spawns the bookkeeping
    /// task, so this must be called within a tokio runtime. Connections
    /// accepted before this point are tracked as long as the listener
    /// buffered their events.
    pub fn build<L: Listener>(self, listener: L) -> Terminator<L> {
        let events = listener.subscribe();
        let inner = Arc::new(Inner {
            listener,
            graceful_termination_timeout: self.graceful_termination_timeout,
            max_wait_for_close: self.max_wait_for_close,
            registry: Mutex::new(Registry::default()),
            state: Mutex::new(TerminationState::Idle),
        });
        tokio::spawn(Inner::pump(Arc::clone(&inner), events));
        Terminator { inner }
    }
}

/// Coordinates the graceful retirement of one [`Listener`].
///
/// Cheap to clone; clones share the same registry and termination state.
pub struct Terminator<L: Listener> {
    inner: Arc<Inner<L>>,
}

impl<L: Listener> Clone for Terminator<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Listener> Terminator<L> {
    /// Attach a coordinator with the default configuration.
    pub fn new(listener: L) -> Self {
        TerminatorBuilder::new().build(listener)
    }

    /// The listener under management.
    pub fn listener(&self) -> &L {
        &self.inner.listener
    }

    /// Whether a termination sequence has started.
    pub fn is_terminating(&self) -> bool {
        self.inner.lock_registry().terminating
    }

    /// Number of currently-registered connections of the given kind.
    pub fn tracked_connections(&self, kind: TransportKind) -> usize {
        self.inner.lock_registry().set(kind).len()
    }

    /// Begin (or join) the termination sequence.
    ///
    /// The first call starts the sequence; the *terminating* flag flips
    /// before this method returns, so connections accepted from here on are
    /// rejected. Any later call logs a warning and resolves to the same
    /// [`Outcome`] as the first; the sweep never runs twice.
    pub fn terminate(&self) -> impl Future<Output = Outcome> + Send + 'static {
        let mut state = self.inner.lock_state();
        match &*state {
            TerminationState::Terminating(shared) => {
                tracing::warn!("already terminating, joining the in-flight sequence");
                Either::Left(shared.clone())
            }
            TerminationState::Done(outcome) => {
                tracing::warn!(code = %outcome.code, "termination already completed");
                Either::Right(ready(outcome.clone()))
            }
            TerminationState::Idle => {
                self.inner.lock_registry().terminating = true;
                // Spawned so the sequence runs to completion even if every
                // caller drops its future; a started sequence is never
                // cancelled.
                let task = tokio::spawn(Inner::run(Arc::clone(&self.inner)));
                let shared: SharedOutcome = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => {
                            tracing::error!(error = %join_error, "termination task failed");
                            Outcome::failed(OutcomeCode::InternalError)
                        }
                    }
                }
                .boxed()
                .shared();
                *state = TerminationState::Terminating(shared.clone());
                Either::Left(shared)
            }
        }
    }
}

enum TerminationState {
    Idle,
    Terminating(SharedOutcome),
    Done(Outcome),
}

/// Live-connection bookkeeping. The terminating flag lives under the same
/// lock as the sets, so the accept-time flag check and the registry insertion
/// are a single atomic step.
#[derive(Default)]
struct Registry {
    terminating: bool,
    plain: HashMap<ConnectionId, Arc<dyn Connection>>,
    encrypted: HashMap<ConnectionId, Arc<dyn Connection>>,
}

impl Registry {
    fn set(&self, kind: TransportKind) -> &HashMap<ConnectionId, Arc<dyn Connection>> {
        match kind {
            TransportKind::Plain => &self.plain,
            TransportKind::Encrypted => &self.encrypted,
        }
    }

    fn set_mut(&mut self, kind: TransportKind) -> &mut HashMap<ConnectionId, Arc<dyn Connection>> {
        match kind {
            TransportKind::Plain => &mut self.plain,
            TransportKind::Encrypted => &mut self.encrypted,
        }
    }

    fn insert(&mut self, conn: Arc<dyn Connection>) {
        self.set_mut(conn.transport_kind()).insert(conn.id(), conn);
    }

    /// No-op if the connection was already removed, e.g. force-closed ahead
    /// of its close event.
    fn remove(&mut self, id: ConnectionId) {
        self.plain.remove(&id);
        self.encrypted.remove(&id);
    }

    fn snapshot(&self, kind: TransportKind) -> Vec<Arc<dyn Connection>> {
        self.set(kind).values().cloned().collect()
    }

    fn drain(&mut self, kind: TransportKind) -> Vec<Arc<dyn Connection>> {
        self.set_mut(kind).drain().map(|(_, conn)| conn).collect()
    }
}

struct Inner<L> {
    listener: L,
    graceful_termination_timeout: Duration,
    max_wait_for_close: Option<Duration>,
    registry: Mutex<Registry>,
    state: Mutex<TerminationState>,
}

impl<L: Listener> Inner<L> {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry lock poisoned")
    }

    fn lock_state(&self) -> MutexGuard<'_, TerminationState> {
        self.state.lock().expect("state lock poisoned")
    }

    /// Applies listener events to the registry. Runs until the listener
    /// drops its event senders.
    async fn pump(inner: Arc<Self>, mut events: UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ConnectionAccepted(conn) => {
                    let rejected = {
                        let mut registry = inner.lock_registry();
                        if registry.terminating {
                            true
                        } else {
                            registry.insert(Arc::clone(&conn));
                            false
                        }
                    };
                    if rejected {
                        tracing::debug!(id = %conn.id(), "destroying connection accepted during termination");
                        conn.force_close();
                    }
                }
                ServerEvent::ConnectionClosed(id) => {
                    inner.lock_registry().remove(id);
                }
                ServerEvent::RequestReceived(response) => {
                    // Requests that arrive after termination begins but
                    // before their connection is reaped must not keep the
                    // connection alive.
                    if inner.lock_registry().terminating && !response.headers_sent() {
                        response.request_close();
                    }
                }
            }
        }
    }

    /// Remove from the registry first: the close event that follows the
    /// force-close must find nothing left to do.
    fn force_close_tracked(&self, conn: &Arc<dyn Connection>) {
        self.lock_registry().remove(conn.id());
        conn.force_close();
    }

    async fn run(inner: Arc<Self>) -> Outcome {
        let outcome = match AssertUnwindSafe(Self::run_sequence(&inner)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_panic) => {
                tracing::error!("termination sequence panicked");
                Outcome::failed(OutcomeCode::InternalError)
            }
        };
        *inner.lock_state() = TerminationState::Done(outcome.clone());
        outcome
    }

    async fn run_sequence(inner: &Arc<Self>) -> Outcome {
        // Synchronous mark-and-reclaim pass over both kinds before any wait.
        for kind in TransportKind::ALL {
            // Snapshot under the lock, sweep outside it.
            let tracked = inner.lock_registry().snapshot(kind);
            for conn in tracked {
                match conn.outstanding_response() {
                    Some(response) if !response.headers_sent() => {
                        // The exchange finishes naturally; the close
                        // directive retires the connection afterwards.
                        response.request_close();
                    }
                    // Headers are already on the wire; swept up at the
                    // grace deadline if still open by then.
                    Some(_) => {}
                    // Idle connections gain nothing from waiting.
                    None => inner.force_close_tracked(&conn),
                }
            }
        }

        // Per-kind grace waits, plain strictly before encrypted.
        for kind in TransportKind::ALL {
            if inner.lock_registry().set(kind).is_empty() {
                continue;
            }
            tokio::time::sleep(inner.graceful_termination_timeout).await;
            let stragglers = inner.lock_registry().drain(kind);
            if !stragglers.is_empty() {
                tracing::debug!(
                    kind = %kind,
                    count = stragglers.len(),
                    "force-closing connections that outlived the grace period"
                );
            }
            for conn in &stragglers {
                conn.force_close();
            }
        }

        inner.close_listener().await
    }

    async fn close_listener(&self) -> Outcome {
        match self.max_wait_for_close {
            Some(max_wait) => {
                // Spawned so that losing the race leaves the close running;
                // the timeout bounds our wait, not the listener's shutdown.
                let close = tokio::spawn(self.listener.close());
                match tokio::time::timeout(max_wait, close).await {
                    Err(_elapsed) => {
                        tracing::warn!(
                            max_wait_ms = max_wait.as_millis() as u64,
                            "listener did not close within the configured wait"
                        );
                        Outcome::failed(OutcomeCode::TimedOut)
                    }
                    Ok(Ok(Ok(()))) => Outcome::terminated(),
                    Ok(Ok(Err(error))) => {
                        tracing::warn!(error = %error, "listener reported an error while closing");
                        Outcome::failed(OutcomeCode::ServerError)
                    }
                    Ok(Err(join_error)) => {
                        tracing::error!(error = %join_error, "listener close task failed");
                        Outcome::failed(OutcomeCode::InternalError)
                    }
                }
            }
            None => match self.listener.close().await {
                Ok(()) => Outcome::terminated(),
                Err(error) => {
                    tracing::warn!(error = %error, "listener reported an error while closing");
                    Outcome::failed(OutcomeCode::ServerError)
                }
            },
        }
    }
}
