//! Loopback TCP transport with length-prefixed framing.
//!
//! Every control-plane exchange runs over IPv6 loopback. The wire format is
//! a 4-byte big-endian payload length followed by that many bytes; frame
//! sizes are validated against [`MAX_MESSAGE_SIZE`] before any allocation.
//!
//! A [`Connection`] owns the read half directly and drains a per-connection
//! send queue on a writer task, so [`Connection::send`] never blocks the
//! caller. Closure is idempotent: dropping the last sender shuts the socket
//! down once.

mod connection;
mod framing;

pub use connection::{bind_in_range, Connection, MessageSender};
pub use framing::{WireCodec, MAX_MESSAGE_SIZE};

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A frame exceeded [`MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge {
        /// Offending payload size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No free port was found in the configured range.
    #[error("no free port in range {min}..={max}")]
    NoPortAvailable {
        /// First port tried.
        min: u16,
        /// Last port tried.
        max: u16,
    },

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
