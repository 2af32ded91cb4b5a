/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Sources of accepted IO streams.
///
/// Implement this over a TLS acceptor (and pass
/// [`TransportKind::Encrypted`](crate::TransportKind::Encrypted) to
/// [`serve_with_transport`](super::serve_with_transport)) to serve encrypted
/// connections; the handshake itself is the implementation's business.
pub trait Accept: Send + 'static {
    /// The accepted IO type.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// The peer address type.
    type Addr: Send + Debug;

    /// Accept the next incoming connection.
    ///
    /// Errors from the underlying accept call must be handled (logged and
    /// retried) here; this future only resolves with a usable connection.
    fn accept(&mut self) -> impl Future<Output = (Self::Io, Self::Addr)> + Send;

    /// Returns the local address this source is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Accept for TcpListener {
    type Io = TcpStream;
    type Addr = std::net::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match Self::accept(self).await {
                Ok(accepted) => return accepted,
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    #[inline]
    fn local_addr(&self) -> io::Result<Self::Addr> {
        Self::local_addr(self)
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match Self::accept(self).await {
                Ok(accepted) => return accepted,
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    #[inline]
    fn local_addr(&self) -> io::Result<Self::Addr> {
        Self::local_addr(self)
    }
}

/// Transient per-connection errors are ignored; anything else (e.g. hitting
/// the file-descriptor limit) is logged and backed off for a second before
/// the next accept attempt.
async fn handle_accept_error(e: io::Error) {
    if is_connection_error(&e) {
        return;
    }

    tracing::error!("accept error: {e}");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}
