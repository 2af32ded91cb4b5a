/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Terminal result of a termination sequence.

use std::fmt;

/// Classification of how a termination sequence ended.
///
/// Exactly one code is produced per sequence and delivered to every caller
/// of [`Terminator::terminate`](crate::Terminator::terminate), including
/// callers that joined while the sequence was already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeCode {
    /// The listener closed cleanly and reported no error.
    Terminated,
    /// The overall wait-for-close timeout elapsed before the listener
    /// finished closing.
    TimedOut,
    /// The listener reported an error while closing.
    ServerError,
    /// An unexpected error occurred outside the listener's own error
    /// channel.
    InternalError,
}

impl OutcomeCode {
    /// String form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Terminated => "TERMINATED",
            OutcomeCode::TimedOut => "TIMED_OUT",
            OutcomeCode::ServerError => "SERVER_ERROR",
            OutcomeCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a termination sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Whether the listener was retired cleanly.
    pub success: bool,
    /// Why the sequence ended the way it did.
    pub code: OutcomeCode,
}

impl Outcome {
    pub(crate) fn terminated() -> Self {
        Self {
            success: true,
            code: OutcomeCode::Terminated,
        }
    }

    pub(crate) fn failed(code: OutcomeCode) -> Self {
        debug_assert!(code != OutcomeCode::Terminated);
        Self { success: false, code }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (success: {})", self.code, self.success)
    }
}
