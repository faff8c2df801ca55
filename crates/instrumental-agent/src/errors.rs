// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use ustr::Ustr;

/// Raised when two commands that do not share a bucket are merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge {left} into {right}: metric and time must match")]
    Mismatch { left: String, right: String },
}

impl MergeError {
    pub(crate) fn mismatch(left: (Ustr, i64), right: (Ustr, i64)) -> Self {
        Self::Mismatch {
            left: format!("{}:{}", left.0, left.1),
            right: format!("{}:{}", right.0, right.1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid collector address: {0}")]
    InvalidCollector(String),

    #[error("Invalid collector port: {0}")]
    InvalidPort(String),

    #[error("API key cannot be empty when the agent is enabled")]
    EmptyApiKey,

    #[error("max_buffer must be greater than 0")]
    InvalidBuffer,
}

/// Errors surfaced while building an [`crate::Agent`].
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Closed set of failure categories the sender keys its retry policy on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    #[display("timeout")]
    Timeout,
    #[display("connection refused")]
    Refused,
    #[display("unreachable")]
    Unreachable,
    #[display("connection closed")]
    Closed,
    #[display("protocol error")]
    Protocol,
}

impl ErrorKind {
    /// Failures after which the sender should not dial again on its own.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::Refused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(what: &str) -> Self {
        Self::new(ErrorKind::Timeout, format!("{what} timed out"))
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => ErrorKind::Closed,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => ErrorKind::Unreachable,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => ErrorKind::Protocol,
            _ => {
                // Host/network unreachable are only exposed through the raw OS code on stable.
                match err.raw_os_error() {
                    Some(code) if is_unreachable_os_error(code) => ErrorKind::Unreachable,
                    _ => ErrorKind::Closed,
                }
            }
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(unix)]
fn is_unreachable_os_error(code: i32) -> bool {
    code == nix::libc::ENETUNREACH || code == nix::libc::EHOSTUNREACH
}

#[cfg(not(unix))]
fn is_unreachable_os_error(_code: i32) -> bool {
    false
}
