//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to stand in for a broker
//! connection. [`LoopbackTransport::create_pair`] returns the client end and
//! a [`LoopbackPeer`] that plays the broker: frames the client sends arrive
//! at the peer, and frames the peer sends arrive at the client.

use std::collections::VecDeque;

use crmsync_proto::frame::{ClientFrame, ServerFrame};
use tokio::sync::{Mutex, mpsc};

use super::{Connector, Transport, TransportError, TransportType};

/// Client end of an in-process connection.
pub struct LoopbackTransport {
    /// Sender toward the peer. Taken on close so the peer observes it.
    tx: parking_lot::Mutex<Option<mpsc::Sender<ClientFrame>>>,
    /// Frames sent by the peer.
    rx: Mutex<mpsc::Receiver<ServerFrame>>,
}

/// Broker end of an in-process connection.
pub struct LoopbackPeer {
    tx: mpsc::Sender<ServerFrame>,
    rx: mpsc::Receiver<ClientFrame>,
}

impl LoopbackTransport {
    /// Create a connected client/peer pair.
    ///
    /// The `buffer` parameter controls the channel capacity for each
    /// direction.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use crmsync::transport::loopback::LoopbackTransport;
    /// use crmsync::transport::Transport;
    /// use crmsync_proto::frame::ServerFrame;
    ///
    /// # async fn example() {
    /// let (client, peer) = LoopbackTransport::create_pair(32);
    /// peer.send(ServerFrame::Connected { username: "alice".into() }).await.unwrap();
    /// let frame = client.recv().await.unwrap();
    /// # }
    /// ```
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackPeer) {
        let (client_tx, peer_rx) = mpsc::channel(buffer);
        let (peer_tx, client_rx) = mpsc::channel(buffer);

        let client = Self {
            tx: parking_lot::Mutex::new(Some(client_tx)),
            rx: Mutex::new(client_rx),
        };
        let peer = LoopbackPeer {
            tx: peer_tx,
            rx: peer_rx,
        };
        (client, peer)
    }

    fn sender(&self) -> Option<mpsc::Sender<ClientFrame>> {
        self.tx.lock().clone()
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.clone())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<ServerFrame, TransportError> {
        if self.sender().is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.sender().is_some_and(|tx| !tx.is_closed())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackPeer {
    /// Send a frame to the client end.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client end is gone.
    pub async fn send(&self, frame: ServerFrame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame the client sent, or `None` once it closed.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.rx.try_recv().ok()
    }
}

/// Connector handing out pre-built loopback transports in order.
///
/// Each `connect` pops the next queued outcome and records the token it was
/// called with. An empty queue behaves like an unreachable broker.
#[derive(Default)]
pub struct LoopbackConnector {
    queue: parking_lot::Mutex<VecDeque<Result<LoopbackTransport, TransportError>>>,
    tokens: parking_lot::Mutex<Vec<String>>,
}

impl LoopbackConnector {
    /// Create a connector with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport for the next successful connect.
    pub fn push(&self, transport: LoopbackTransport) {
        self.queue.lock().push_back(Ok(transport));
    }

    /// Queue a failure for the next connect.
    pub fn push_error(&self, error: TransportError) {
        self.queue.lock().push_back(Err(error));
    }

    /// Tokens passed to `connect`, in call order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.tokens.lock().len()
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, token: &str) -> Result<LoopbackTransport, TransportError> {
        self.tokens.lock().push(token.to_string());
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Unreachable("loopback".to_string())))
    }
}
