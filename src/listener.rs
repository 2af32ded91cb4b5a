/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Listener collaborator trait and its event stream.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::connection::{Connection, ConnectionId, OutstandingResponse};
use crate::BoxError;

/// Lifecycle events a listener reports to the terminator.
pub enum ServerEvent {
    /// A connection of either transport kind was accepted.
    ConnectionAccepted(Arc<dyn Connection>),
    /// A connection's transport closed, for any reason.
    ConnectionClosed(ConnectionId),
    /// A request began on some connection; carries the handle of the
    /// response that will answer it.
    RequestReceived(Arc<dyn OutstandingResponse>),
}

impl fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::ConnectionAccepted(conn) => f
                .debug_tuple("ConnectionAccepted")
                .field(&conn.id())
                .field(&conn.transport_kind())
                .finish(),
            ServerEvent::ConnectionClosed(id) => f.debug_tuple("ConnectionClosed").field(id).finish(),
            ServerEvent::RequestReceived(_) => f.debug_tuple("RequestReceived").finish(),
        }
    }
}

/// The network listener managed by a [`Terminator`](crate::Terminator).
///
/// The terminator subscribes to the event stream once, at construction, and
/// calls [`close`](Listener::close) exactly once, as the final step of the
/// termination sequence.
pub trait Listener: Send + Sync + 'static {
    /// Hand over the stream of lifecycle events.
    ///
    /// Called a single time per listener. Events that fired before the
    /// subscriber attached must be buffered and delivered in order.
    fn subscribe(&self) -> UnboundedReceiver<ServerEvent>;

    /// Stop listening and release the bound resources.
    ///
    /// Resolves once the listener has fully shut down; an `Err` reports a
    /// close failure and is translated into a
    /// [`SERVER_ERROR`](crate::OutcomeCode::ServerError) outcome.
    fn close(&self) -> BoxFuture<'static, Result<(), BoxError>>;
}
