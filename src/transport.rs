//! The transport boundary this crate consumes (§6.2).
//!
//! Sending, receiving and framing SIP messages over UDP/TCP/TLS/WS/WSS is
//! out of scope; the core only needs somewhere to hand finished
//! `rsip::Request`/`rsip::Response` values to, and a stream of incoming
//! ones to dispatch. Implement [`Transport`] against whatever transport
//! stack the application already has.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use rsip::SipMessage;

use crate::error::DialogError;

/// A peer address a message is sent to or received from.
pub type Destination = SocketAddr;

/// Error a `Transport::send` call can fail with. Maps onto
/// [`DialogError::TransportFailure`] at the call site.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The transport's outbound buffer is full; the caller may retry after
    /// backing off.
    WouldBlock,
    /// The destination is not currently reachable (e.g. connection reset).
    Unreachable(String),
    /// A non-retryable failure (e.g. TLS handshake rejected).
    Fatal(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock => write!(f, "transport would block"),
            TransportError::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            TransportError::Fatal(reason) => write!(f, "fatal transport error: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for DialogError {
    fn from(err: TransportError) -> Self {
        let retryable = matches!(err, TransportError::WouldBlock | TransportError::Unreachable(_));
        DialogError::transport_failure(err.to_string(), retryable)
    }
}

/// The external transport collaborator. Implementations own sockets,
/// framing, and retry-at-the-socket-level concerns; the core only calls
/// `send`, asks `is_reliable` to pick RFC 3261 Timer D/H/I/J/K values, and
/// reads from `recv` in its dispatch loop.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one SIP message. May return `WouldBlock` under backpressure;
    /// the transaction layer treats that as retryable within a single
    /// retransmission slot (§7 Retry policy).
    async fn send(&self, destination: Destination, message: SipMessage) -> Result<(), TransportError>;

    /// Blocks until the next inbound message is available.
    async fn recv(&self) -> Option<(Destination, SipMessage)>;

    /// Whether `destination` is reached over a reliable transport (TCP,
    /// TLS, WS, WSS). Unreliable (UDP) destinations get the RFC 3261
    /// absorption-timer values; reliable ones use `Duration::ZERO`.
    fn is_reliable(&self, destination: Destination) -> bool;
}
