/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Graceful termination for HTTP servers.
//!
//! An operator wants to stop accepting new work and retire a listener
//! without abruptly severing in-flight request/response exchanges, while
//! still bounding total shutdown latency so the process exits
//! deterministically, e.g. inside an orchestrator's SIGTERM grace period.
//!
//! The [`Terminator`] coordinates that retirement for a single listener:
//!
//! 1. **Track**: live connections are registered per transport kind
//!    (plain / encrypted) from accept to close.
//! 2. **Wind down**: on [`Terminator::terminate`], new connections are
//!    rejected, in-flight responses that have not flushed headers are
//!    marked `Connection: close`, and idle connections are reclaimed
//!    immediately.
//! 3. **Bound**: each transport kind gets a grace period; connections
//!    still open afterwards are forcibly closed.
//! 4. **Report**: the listener is closed (optionally raced against an
//!    overall timeout) and a single [`Outcome`] is delivered to every
//!    caller, even those that joined mid-sequence.
//!
//! ```text
//! ┌──────────┐  accepted/closed/request  ┌────────────┐  terminate()
//! │ Listener │──────────────────────────▶│ Terminator │◀─────────────
//! │          │◀──────────────────────────│  registry  │──▶ Outcome
//! └──────────┘  close / force-close      └────────────┘
//! ```
//!
//! The [`serve`] module provides the Hyper-backed listener; any other
//! server can participate by implementing the [`Listener`], [`Connection`],
//! and [`OutstandingResponse`] collaborator traits.
//!
//! ```rust,ignore
//! use http_terminator::{serve::serve, TerminatorBuilder};
//! use std::time::Duration;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! let terminator = TerminatorBuilder::new()
//!     .graceful_termination_timeout(Duration::from_secs(5))
//!     .max_wait_for_close(Duration::from_secs(10))
//!     .build(serve(listener, service));
//!
//! tokio::signal::ctrl_c().await?;
//! match terminator.terminate().await {
//!     outcome if outcome.success => tracing::info!("listener retired"),
//!     outcome => tracing::error!(code = %outcome.code, "shutdown was not clean"),
//! }
//! ```

pub mod connection;
pub mod listener;
pub mod outcome;
pub mod serve;
pub mod terminator;

#[doc(inline)]
pub use self::connection::{Connection, ConnectionId, OutstandingResponse, TransportKind};
#[doc(inline)]
pub use self::listener::{Listener, ServerEvent};
#[doc(inline)]
pub use self::outcome::{Outcome, OutcomeCode};
#[doc(inline)]
pub use self::terminator::{Terminator, TerminatorBuilder, DEFAULT_GRACEFUL_TERMINATION_TIMEOUT};

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
