// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type shared by the whole crate.
//!
//! Only recoverable conditions are reported through [`Error`]. Programming
//! errors (non-consecutive frame indices, requests for a frame the barrier has
//! not reached, double release of a pooled buffer) panic instead.

use std::fmt;
use std::io;

/// Errors returned by transports and the wire codec.
///
/// # Example
///
/// ```ignore
/// match transport.send(&message, &payload) {
///     Err(Error::MessageTooLarge { size, max }) => log::warn!("{} > {}", size, max),
///     Err(e) => log::warn!("send failed: {}", e),
///     Ok(()) => {}
/// }
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Wire format
    // ========================================================================
    /// Header plus extra data exceed the transport maximum message size.
    MessageTooLarge { size: usize, max: usize },
    /// Datagram shorter than the header of its message type.
    Truncated { needed: usize, available: usize },
    /// Type byte does not name a known message.
    UnknownMessageType(u8),
    /// A header field holds a value outside its valid range.
    InvalidField(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// I/O error with underlying cause.
    IoError(io::Error),
    /// Failed to bind socket to address.
    BindFailed(String),
    /// Failed to join multicast group.
    MulticastJoinFailed(String),
    /// No network interface usable for multicast.
    NoInterface,
    /// Send operation failed.
    SendFailed(String),

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Configuration value rejected.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            Error::Truncated { needed, available } => write!(
                f,
                "Truncated message: needed {} bytes, got {}",
                needed, available
            ),
            Error::UnknownMessageType(ty) => write!(f, "Unknown message type: {}", ty),
            Error::InvalidField(msg) => write!(f, "Invalid field: {}", msg),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Error::MulticastJoinFailed(msg) => write!(f, "Multicast join failed: {}", msg),
            Error::NoInterface => write!(f, "No network interface usable for multicast"),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Convenient alias for results using the crate [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_messages() {
        let err = Error::MessageTooLarge {
            size: 1500,
            max: 1399,
        };
        assert_eq!(err.to_string(), "Message too large: 1500 bytes (max 1399)");
        assert_eq!(
            Error::UnknownMessageType(42).to_string(),
            "Unknown message type: 42"
        );
    }

    #[test]
    fn test_io_error_source() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(err.source().is_some());
        assert!(Error::NoInterface.source().is_none());
    }
}
