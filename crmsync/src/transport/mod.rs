//! Transport layer abstraction for crmsync.
//!
//! Defines the [`Transport`] trait that carries protocol frames over one
//! persistent connection, and the [`Connector`] trait that opens such a
//! connection for a bearer token. Concrete implementations:
//! - [`ws::WsTransport`] over a WebSocket to the broker
//! - [`loopback::LoopbackTransport`] in-process channels for testing

pub mod loopback;
pub mod ws;

use std::fmt;

use crmsync_proto::frame::{ClientFrame, CodecError, ServerFrame};

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to a broker.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting or the handshake did not complete in time.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker could not be reached at all.
    #[error("broker at {0} is unreachable")]
    Unreachable(String),

    /// The broker refused the connection (bad or expired token).
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport carrying protocol frames over one connection.
///
/// A transport is connected when created. `recv` yields server frames in
/// the order the connection delivered them; callers rely on this for
/// per-topic ordering.
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the broker.
    ///
    /// Returns `Ok(())` once the frame has been handed to the connection.
    /// This is not a delivery guarantee.
    fn send(
        &self,
        frame: &ClientFrame,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame from the broker.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is
    /// gone; no further frames follow.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerFrame, TransportError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Check whether the connection is still open.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens authenticated transports.
///
/// The session calls [`Connector::connect`] with the stored bearer token on
/// every connect attempt.
pub trait Connector: Send + Sync + 'static {
    /// Transport produced by this connector.
    type Transport: Transport;

    /// Open a connection authenticated with `token`.
    ///
    /// Resolves once the broker has accepted the token.
    fn connect(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Self::Transport, TransportError>> + Send;
}
