/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Hyper integration: an HTTP/1 server whose connections are tracked for
//! graceful termination.
//!
//! [`serve`] spawns an accept loop that serves every connection with Hyper
//! and reports connection and exchange lifecycle events through the
//! [`Listener`] trait, so the returned [`HttpServer`] can be handed straight
//! to a [`Terminator`](crate::Terminator):
//!
//! ```text
//! ┌────────┐      ┌──────────────┐      ┌───────────────────────┐
//! │ Accept │─────▶│ Hyper http/1 │─────▶│ ServerEvent stream    │
//! │  loop  │      │  connection  │      │ (accepted/closed/     │
//! └────────┘      └──────────────┘      │  request began)       │
//!                                       └───────────┬───────────┘
//!                                                   ▼
//!                                             Terminator
//! ```
//!
//! ```rust,ignore
//! use http_terminator::{serve::serve, Terminator};
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! let server = serve(listener, service);
//! let terminator = Terminator::new(server);
//!
//! tokio::signal::ctrl_c().await?;
//! let outcome = terminator.terminate().await;
//! ```
//!
//! Connections are served with HTTP/1 keep-alive semantics; the "do not
//! reuse" directive installed during termination is a `Connection: close`
//! response header, which is an http/1.x mechanism. TLS deployments
//! implement [`Accept`] over their acceptor and tag connections with
//! [`TransportKind::Encrypted`] via [`serve_with_transport`]; the handshake
//! itself stays on the acceptor's side of the seam.

use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::{self, HeaderValue};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower::{Service, ServiceExt as _};

use crate::connection::{Connection, ConnectionId, OutstandingResponse, TransportKind};
use crate::listener::{Listener, ServerEvent};
use crate::BoxError;

mod accept;

pub use self::accept::Accept;

/// Serve plain-transport connections from `acceptor` with `service`.
///
/// Equivalent to [`serve_with_transport`] with [`TransportKind::Plain`].
pub fn serve<A, S, B>(acceptor: A, service: S) -> HttpServer
where
    A: Accept,
    S: Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    serve_with_transport(acceptor, service, TransportKind::Plain)
}

/// Serve connections from `acceptor` with `service`, tracking each one under
/// the given transport kind.
///
/// Spawns the accept loop immediately, so this must be called within a tokio
/// runtime. The service must be infallible: application errors are expected
/// to surface as HTTP error responses, not as Tower errors.
pub fn serve_with_transport<A, S, B>(mut acceptor: A, service: S, transport: TransportKind) -> HttpServer
where
    A: Accept,
    S: Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let (events, subscriber) = mpsc::unbounded_channel();
    let inner = Arc::new(ServerInner {
        events: Mutex::new(Some(subscriber)),
        shutdown: Notify::new(),
        accept_task: Mutex::new(None),
        active: AtomicUsize::new(0),
        listening: AtomicBool::new(true),
    });

    let accept_task = tokio::spawn({
        let server = Arc::clone(&inner);
        async move {
            let builder = http1::Builder::new();
            loop {
                tokio::select! {
                    accepted = acceptor.accept() => {
                        let (io, remote_addr) = accepted;
                        serve_accepted(builder.clone(), io, remote_addr, transport, service.clone(), &events, &server);
                    }
                    _ = server.shutdown.notified() => {
                        tracing::trace!("close requested, no longer accepting connections");
                        break;
                    }
                }
            }
            server.listening.store(false, Ordering::SeqCst);
            // The acceptor drops here, releasing the bound socket.
        }
    });
    *inner.lock_accept_task() = Some(accept_task);

    HttpServer { inner }
}

/// Register an accepted connection and spawn the task that serves it.
fn serve_accepted<I, S, B>(
    builder: http1::Builder,
    io: I,
    remote_addr: impl Debug,
    transport: TransportKind,
    service: S,
    events: &UnboundedSender<ServerEvent>,
    server: &Arc<ServerInner>,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    S: Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let connection = Arc::new(TrackedConnection::new(transport));
    tracing::trace!(id = %connection.id(), "connection {remote_addr:?} accepted");

    let accepted: Arc<dyn Connection> = connection.clone();
    let _ = events.send(ServerEvent::ConnectionAccepted(accepted));
    server.active.fetch_add(1, Ordering::SeqCst);

    let tracked_service = TrackedService {
        service,
        connection: Arc::clone(&connection),
        events: events.clone(),
    };

    let events = events.clone();
    let server = Arc::clone(server);
    tokio::spawn(async move {
        {
            let serving = builder.serve_connection(TokioIo::new(io), tracked_service);
            tokio::pin!(serving);
            tokio::select! {
                result = serving.as_mut() => {
                    if let Err(err) = result {
                        tracing::trace!(error = ?err, "failed to serve connection");
                    }
                }
                _ = connection.force_close_requested() => {
                    tracing::trace!(id = %connection.id(), "connection forcibly closed");
                }
            }
            // The connection future (and with it the transport) drops here,
            // severing the stream without flushing buffered writes when the
            // force-close branch won.
        }
        server.active.fetch_sub(1, Ordering::SeqCst);
        let _ = events.send(ServerEvent::ConnectionClosed(connection.id()));
    });
}

/// A running, connection-tracked HTTP server.
///
/// Implements [`Listener`]; hand it to a
/// [`Terminator`](crate::Terminator) to manage its retirement. Cheap to
/// clone.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

impl HttpServer {
    /// Number of open connections, in-flight or idle.
    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether the accept loop is still running.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("active_connections", &self.active_connections())
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

impl Listener for HttpServer {
    fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        match self.inner.lock_events().take() {
            Some(receiver) => receiver,
            None => {
                tracing::warn!("event stream already subscribed, returning a stream that never yields");
                let (_sender, receiver) = mpsc::unbounded_channel();
                receiver
            }
        }
    }

    fn close(&self) -> BoxFuture<'static, Result<(), BoxError>> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.shutdown.notify_one();
            let task = inner.lock_accept_task().take();
            match task {
                Some(task) => task.await.map_err(|e| BoxError::from(CloseError::AcceptLoop(e))),
                None => Err(BoxError::from(CloseError::AlreadyClosed)),
            }
        }
        .boxed()
    }
}

/// Why [`HttpServer::close`](Listener::close) failed.
#[derive(Debug, Error)]
pub enum CloseError {
    /// The accept loop was already stopped by an earlier close.
    #[error("listener is already closed")]
    AlreadyClosed,
    /// The accept loop task failed before finishing its shutdown.
    #[error("accept loop task failed: {0}")]
    AcceptLoop(#[from] tokio::task::JoinError),
}

struct ServerInner {
    events: Mutex<Option<UnboundedReceiver<ServerEvent>>>,
    shutdown: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicUsize,
    listening: AtomicBool,
}

impl ServerInner {
    fn lock_events(&self) -> MutexGuard<'_, Option<UnboundedReceiver<ServerEvent>>> {
        self.events.lock().expect("event stream lock poisoned")
    }

    fn lock_accept_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.accept_task.lock().expect("accept task lock poisoned")
    }
}

/// Per-connection tracking state shared between the serving task and the
/// terminator's registry.
struct TrackedConnection {
    id: ConnectionId,
    transport: TransportKind,
    outstanding: Mutex<Option<Arc<ResponseState>>>,
    force_close: Notify,
}

impl TrackedConnection {
    fn new(transport: TransportKind) -> Self {
        Self {
            id: ConnectionId::next(),
            transport,
            outstanding: Mutex::new(None),
            force_close: Notify::new(),
        }
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, Option<Arc<ResponseState>>> {
        self.outstanding.lock().expect("outstanding exchange lock poisoned")
    }

    fn begin_exchange(&self, response: Arc<ResponseState>) {
        *self.lock_outstanding() = Some(response);
    }

    /// Clears the binding only if `response` is still the current exchange.
    fn finish_exchange(&self, response: &Arc<ResponseState>) {
        let mut outstanding = self.lock_outstanding();
        if outstanding.as_ref().is_some_and(|current| Arc::ptr_eq(current, response)) {
            *outstanding = None;
        }
    }

    async fn force_close_requested(&self) {
        self.force_close.notified().await;
    }
}

impl Connection for TrackedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn transport_kind(&self) -> TransportKind {
        self.transport
    }

    fn outstanding_response(&self) -> Option<Arc<dyn OutstandingResponse>> {
        self.lock_outstanding()
            .clone()
            .map(|response| response as Arc<dyn OutstandingResponse>)
    }

    fn force_close(&self) {
        // The permit is stored, so a force-close that lands before the
        // serving task first polls its signal is not lost.
        self.force_close.notify_one();
    }
}

/// Response-side state of one exchange.
#[derive(Default)]
struct ResponseState {
    headers_sent: AtomicBool,
    close_requested: AtomicBool,
}

impl ResponseState {
    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    fn mark_headers_sent(&self) {
        self.headers_sent.store(true, Ordering::SeqCst);
    }
}

impl OutstandingResponse for ResponseState {
    fn headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::SeqCst)
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }
}

/// Hyper service that publishes exchange lifecycle events and applies the
/// close directive before a response's headers reach the wire.
struct TrackedService<S> {
    service: S,
    connection: Arc<TrackedConnection>,
    events: UnboundedSender<ServerEvent>,
}

impl<S, B> hyper::service::Service<http::Request<Incoming>> for TrackedService<S>
where
    S: Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = http::Response<TrackedBody<B>>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn call(&self, request: http::Request<Incoming>) -> Self::Future {
        let response_state = Arc::new(ResponseState::default());
        self.connection.begin_exchange(Arc::clone(&response_state));
        let began: Arc<dyn OutstandingResponse> = response_state.clone();
        let _ = self.events.send(ServerEvent::RequestReceived(began));

        let connection = Arc::clone(&self.connection);
        let service = self.service.clone();
        Box::pin(async move {
            let mut response = service
                .oneshot(request)
                .await
                .expect("service error type is Infallible and cannot fail");

            if response_state.close_requested() {
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
            response_state.mark_headers_sent();

            // The exchange stays outstanding until the response body is
            // fully written (or abandoned), not until the handler returns;
            // a connection streaming a body is not idle.
            let guard = ExchangeGuard {
                connection,
                response: response_state,
            };
            Ok(response.map(|inner| TrackedBody {
                inner,
                guard: Some(guard),
            }))
        })
    }
}

struct ExchangeGuard {
    connection: Arc<TrackedConnection>,
    response: Arc<ResponseState>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.connection.finish_exchange(&self.response);
    }
}

pin_project! {
    /// Response body that reports exchange completion back to its
    /// connection, on end-of-stream or on drop.
    struct TrackedBody<B> {
        #[pin]
        inner: B,
        guard: Option<ExchangeGuard>,
    }
}

impl<B: HttpBody> HttpBody for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let poll = this.inner.poll_frame(cx);
        if matches!(&poll, Poll::Ready(None)) {
            this.guard.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
