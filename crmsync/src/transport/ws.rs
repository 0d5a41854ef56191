//! WebSocket transport to the crmsync broker.
//!
//! Implements [`Transport`] over one WebSocket connection. The bearer token
//! travels as the `token` query parameter of the upgrade request; the broker
//! answers with a `CONNECTED` frame on success or an `ERROR` frame followed
//! by a close on rejection. Every text frame carries one JSON frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crmsync_proto::frame::{self, ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the `CONNECTED` frame after the upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport implementing the [`Transport`] trait.
///
/// Created via [`WsTransport::connect`], which opens the socket, waits for
/// the broker to accept the token, and spawns a background reader task.
pub struct WsTransport {
    /// Broker endpoint without the token query parameter.
    endpoint: String,
    /// Username the broker authenticated.
    username: String,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Frames decoded by the background reader task.
    incoming: Mutex<mpsc::Receiver<ServerFrame>>,
    /// Whether the WebSocket connection is open.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect to the broker at `endpoint` authenticated by `token`.
    ///
    /// Performs the following steps:
    /// 1. Appends `token` as a query parameter and opens the WebSocket
    ///    (bounded by `connect_timeout`)
    /// 2. Waits for the broker's `CONNECTED` frame (bounded by
    ///    `handshake_timeout`)
    /// 3. Spawns a background task to decode incoming frames
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connecting or the handshake times out.
    /// - [`TransportError::Unreachable`] if nothing accepts the connection.
    /// - [`TransportError::Rejected`] if the broker refuses the token.
    /// - [`TransportError::Io`] for other WebSocket failures.
    pub async fn connect(
        endpoint: &Url,
        token: &str,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut url = endpoint.clone();
        url.query_pairs_mut().append_pair("token", token);

        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %endpoint, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %endpoint, error = %e, "WebSocket connect failed");
                map_ws_connect_error(endpoint, e)
            })?;

        let (ws_sender, mut ws_reader) = ws_stream.split();

        let username = tokio::time::timeout(handshake_timeout, await_connected(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url = %endpoint, "broker handshake timed out");
                TransportError::Timeout
            })??;
        tracing::info!(username = %username, url = %endpoint, "connected to broker");

        let (tx, rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(Self {
            endpoint: endpoint.to_string(),
            username,
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// Return the broker endpoint (without credentials).
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Return the username the broker authenticated.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Transport for WsTransport {
    /// Send one frame as a WebSocket text message.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionClosed`] if the connection is down.
    /// - [`TransportError::Codec`] if the frame cannot be encoded.
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = frame::encode_client(frame)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(error = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    /// Receive the next frame decoded by the background reader.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the reader task has
    /// exited.
    async fn recv(&self) -> Result<ServerFrame, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(error = %e, "close frame not sent");
        }
        self.reader_handle.abort();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Reads frames until the broker accepts or rejects the connection.
///
/// Control frames are skipped. Anything other than `CONNECTED` or `ERROR`
/// in text form is a protocol violation.
async fn await_connected(ws_reader: &mut WsReader) -> Result<String, TransportError> {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match frame::decode_server(&text) {
                    Ok(ServerFrame::Connected { username }) => Ok(username),
                    Ok(ServerFrame::Error { message }) => {
                        tracing::warn!(reason = %message, "broker rejected connection");
                        Err(TransportError::Rejected(message))
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "unexpected frame during handshake");
                        Err(TransportError::Io(std::io::Error::other(
                            "unexpected frame during handshake",
                        )))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed handshake frame");
                        Err(TransportError::Io(std::io::Error::other(format!(
                            "malformed handshake frame: {e}"
                        ))))
                    }
                };
            }
            Ok(Message::Close(_)) => {
                tracing::warn!("broker closed connection during handshake");
                return Err(TransportError::ConnectionClosed);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    tracing::warn!("WebSocket stream ended during handshake");
    Err(TransportError::ConnectionClosed)
}

/// Background task that decodes WebSocket text frames.
///
/// Malformed frames are logged and skipped; the connection stays up.
/// Sets `connected` to `false` when the WebSocket closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerFrame>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match frame::decode_server(&text) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed broker frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by broker");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(
    endpoint: &Url,
    err: tokio_tungstenite::tungstenite::Error,
) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(endpoint.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) if response.status().as_u16() == 401 => {
            TransportError::Rejected("unauthorized".to_string())
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "broker HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "broker connection error: {other}"
        ))),
    }
}

/// Connector opening [`WsTransport`]s to one broker endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for `endpoint` with default timeouts.
    #[must_use]
    pub const fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the connect and handshake timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// Return the configured endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, token: &str) -> Result<WsTransport, TransportError> {
        WsTransport::connect(
            &self.endpoint,
            token,
            self.connect_timeout,
            self.handshake_timeout,
        )
        .await
    }
}
