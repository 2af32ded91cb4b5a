/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Connection collaborator traits.
//!
//! The terminator never owns a connection's IO lifecycle. It observes
//! connections through these traits and, during shutdown, instructs them to
//! close: cooperatively via [`OutstandingResponse::request_close`], or
//! abruptly via [`Connection::force_close`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transport classification of an accepted connection.
///
/// Plain and encrypted connections are tracked in separate registry sets and
/// swept separately during termination. The kind is fixed at registration
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Cleartext transport.
    Plain,
    /// TLS (or otherwise encrypted) transport.
    Encrypted,
}

impl TransportKind {
    /// Sweep order: plain first, then encrypted.
    pub(crate) const ALL: [TransportKind; 2] = [TransportKind::Plain, TransportKind::Encrypted];

    /// String form of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Plain => "plain",
            TransportKind::Encrypted => "encrypted",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a tracked connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The response side of an exchange that is currently in flight.
pub trait OutstandingResponse: Send + Sync {
    /// Whether the response headers have already been written toward the
    /// peer. Once they have, a close directive can no longer be applied.
    fn headers_sent(&self) -> bool;

    /// Ask that the connection not be reused once this exchange completes.
    ///
    /// For HTTP this surfaces as a `Connection: close` response header.
    /// Calling this after the headers are sent has no effect.
    fn request_close(&self);
}

/// A live connection tracked by the terminator.
pub trait Connection: Send + Sync + 'static {
    /// Stable identity used for registry bookkeeping.
    fn id(&self) -> ConnectionId;

    /// Which registry set the connection belongs to.
    fn transport_kind(&self) -> TransportKind;

    /// The response of the exchange currently in flight on this connection,
    /// if one is mid-flight. `None` means the connection is idle.
    fn outstanding_response(&self) -> Option<Arc<dyn OutstandingResponse>>;

    /// Abruptly sever the underlying transport without waiting for buffered
    /// writes. Must be safe to call more than once.
    fn force_close(&self);
}
