// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes carried in protocol error envelopes.
///
/// The kernel never throws across the transport boundary; failures are
/// serialized as `"CODE: message"` strings built with [`ErrorCode::message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolError,
    LockViolation,
    QueueOverflow,
    HandlerError,
    ThunkRegistrationError,
    AccessDenied,
    Timeout,
    Destroyed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::LockViolation => "LOCK_VIOLATION",
            Self::QueueOverflow => "QUEUE_OVERFLOW",
            Self::HandlerError => "HANDLER_ERROR",
            Self::ThunkRegistrationError => "THUNK_REGISTRATION_ERROR",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::Destroyed => "DESTROYED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Build the wire error string for this code.
    pub fn message(&self, detail: impl fmt::Display) -> String {
        format!("{}: {detail}", self.as_str())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a wire error string carries the given code prefix.
pub fn has_code(error: &str, code: ErrorCode) -> bool {
    error.starts_with(code.as_str())
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
