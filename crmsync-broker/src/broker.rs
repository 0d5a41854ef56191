//! Broker core: shared state, WebSocket handler, subscription table, and
//! topic fan-out.
//!
//! Clients connect to `/ws?token=...`. The token is looked up in the
//! [`TokenTable`]; a known token gets a `CONNECTED` frame naming the user,
//! an unknown one gets an `ERROR` frame and the socket is closed.
//!
//! Each connection keeps its own subscription table. A `SEND` to a
//! `/topic/...` destination is delivered to every subscription on that
//! destination, the sender's own included. `/user/...` destinations are
//! resolved against the connection's user and can only be fed by the
//! server, through `POST /notify/{username}`. Nothing is queued: a message
//! with no subscriber is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use crmsync_proto::frame::{self, ClientFrame, ServerFrame};
use crmsync_proto::topic::{SubscriptionId, USER_NOTIFICATION_DESTINATION};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};

use crate::auth::TokenTable;

/// Default maximum message body size in bytes (64 KB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

const TOPIC_PREFIX: &str = "/topic/";
const USER_PREFIX: &str = "/user/";

/// One live client connection.
struct Connection {
    username: String,
    sender: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<SubscriptionId, String>,
}

/// Shared broker state: token table, live connections, and limits.
pub struct BrokerState {
    tokens: TokenTable,
    connections: RwLock<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
    max_body_size: usize,
}

impl BrokerState {
    /// Creates a broker with the default body size limit.
    #[must_use]
    pub fn new(tokens: TokenTable) -> Self {
        Self::with_config(tokens, DEFAULT_MAX_BODY_SIZE)
    }

    /// Creates a broker with a custom body size limit.
    #[must_use]
    pub fn with_config(tokens: TokenTable, max_body_size: usize) -> Self {
        Self {
            tokens,
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            max_body_size,
        }
    }

    /// Username for `token`, if the token is known.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.lookup(token).map(str::to_string)
    }

    /// Registers a connection for `username` and returns its id.
    pub async fn register(&self, username: &str, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        conns.insert(
            id,
            Connection {
                username: username.to_string(),
                sender,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    /// Removes a connection and all of its subscriptions.
    pub async fn unregister(&self, connection: u64) -> bool {
        self.connections.write().await.remove(&connection).is_some()
    }

    /// Adds or replaces a subscription on a connection.
    ///
    /// Returns `false` if the connection is gone.
    pub async fn subscribe(&self, connection: u64, id: SubscriptionId, destination: &str) -> bool {
        let mut conns = self.connections.write().await;
        let Some(conn) = conns.get_mut(&connection) else {
            return false;
        };
        conn.subscriptions.insert(id, destination.to_string());
        true
    }

    /// Removes a subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, connection: u64, id: SubscriptionId) -> bool {
        let mut conns = self.connections.write().await;
        conns
            .get_mut(&connection)
            .is_some_and(|conn| conn.subscriptions.remove(&id).is_some())
    }

    /// Delivers `body` to every subscription on a `/topic/...` destination.
    ///
    /// Returns the number of deliveries.
    pub async fn publish(&self, destination: &str, body: &str) -> usize {
        let conns = self.connections.read().await;
        conns
            .values()
            .map(|conn| deliver(conn, destination, body))
            .sum()
    }

    /// Delivers a notification to every connection of `username` subscribed
    /// to the notification queue.
    ///
    /// Returns the number of deliveries.
    pub async fn notify_user(&self, username: &str, body: &str) -> usize {
        let conns = self.connections.read().await;
        conns
            .values()
            .filter(|conn| conn.username == username)
            .map(|conn| deliver(conn, USER_NOTIFICATION_DESTINATION, body))
            .sum()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of subscriptions on `destination` across all connections.
    pub async fn subscriber_count(&self, destination: &str) -> usize {
        let conns = self.connections.read().await;
        conns
            .values()
            .flat_map(|conn| conn.subscriptions.values())
            .filter(|d| d.as_str() == destination)
            .count()
    }

    /// Send a WebSocket Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            tracing::info!(connection = id, username = %conn.username, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    async fn send_error(&self, connection: u64, message: String) {
        let conns = self.connections.read().await;
        if let Some(conn) = conns.get(&connection) {
            send_server_frame(&conn.sender, &ServerFrame::Error { message });
        }
    }
}

/// Sends one `MESSAGE` per matching subscription of `conn`.
fn deliver(conn: &Connection, destination: &str, body: &str) -> usize {
    let mut delivered = 0;
    for (id, subscribed) in &conn.subscriptions {
        if subscribed != destination {
            continue;
        }
        let message = ServerFrame::Message {
            subscription: *id,
            destination: destination.to_string(),
            body: body.to_string(),
        };
        if send_server_frame(&conn.sender, &message) {
            delivered += 1;
        }
    }
    delivered
}

fn send_server_frame(sender: &mpsc::UnboundedSender<Message>, server_frame: &ServerFrame) -> bool {
    match frame::encode_server(server_frame) {
        Ok(text) => sender.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server frame");
            false
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Reject with `ERROR` and close if the token was unknown.
/// 2. Register the connection and send `CONNECTED`.
/// 3. Process client frames until the socket closes.
/// 4. Unregister, dropping every subscription.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>, username: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(username) = username else {
        tracing::warn!("rejecting connection with unknown token");
        let _ = send_direct(
            &mut ws_sender,
            &ServerFrame::Error {
                message: "invalid token".to_string(),
            },
        )
        .await;
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(&username, tx).await;

    let hello = ServerFrame::Connected {
        username: username.clone(),
    };
    if let Err(e) = send_direct(&mut ws_sender, &hello).await {
        tracing::error!(username = %username, error = %e, "failed to send CONNECTED");
        state.unregister(connection).await;
        return;
    }
    tracing::info!(connection, username = %username, "client connected");

    let writer_user = username.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(username = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = username.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(connection, &reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(username = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(connection).await;
    tracing::info!(connection, username = %username, "client disconnected");
}

/// Handles one text frame from an authenticated connection.
async fn handle_text_frame(connection: u64, username: &str, text: &str, state: &BrokerState) {
    let client_frame = match frame::decode_client(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(username = %username, error = %e, "failed to decode client frame");
            state
                .send_error(connection, format!("malformed frame: {e}"))
                .await;
            return;
        }
    };

    match client_frame {
        ClientFrame::Subscribe { id, destination } => {
            if destination != USER_NOTIFICATION_DESTINATION && !destination.starts_with(TOPIC_PREFIX)
            {
                tracing::warn!(username = %username, destination = %destination, "subscribe to unknown destination");
                state
                    .send_error(connection, format!("unknown destination: {destination}"))
                    .await;
                return;
            }
            state.subscribe(connection, id, &destination).await;
            tracing::debug!(username = %username, %id, destination = %destination, "subscribed");
        }
        ClientFrame::Unsubscribe { id } => {
            if state.unsubscribe(connection, id).await {
                tracing::debug!(username = %username, %id, "unsubscribed");
            } else {
                tracing::debug!(username = %username, %id, "unsubscribe for unknown id");
            }
        }
        ClientFrame::Send { destination, body } => {
            if destination.starts_with(USER_PREFIX) {
                tracing::warn!(username = %username, destination = %destination, "client send to user queue");
                state
                    .send_error(connection, format!("clients cannot send to {destination}"))
                    .await;
                return;
            }
            if !destination.starts_with(TOPIC_PREFIX) {
                state
                    .send_error(connection, format!("unknown destination: {destination}"))
                    .await;
                return;
            }
            if body.len() > state.max_body_size {
                tracing::warn!(
                    username = %username,
                    size = body.len(),
                    max = state.max_body_size,
                    "body exceeds size limit"
                );
                state
                    .send_error(
                        connection,
                        format!(
                            "body too large: {} bytes (max {})",
                            body.len(),
                            state.max_body_size
                        ),
                    )
                    .await;
                return;
            }
            let delivered = state.publish(&destination, &body).await;
            tracing::debug!(username = %username, destination = %destination, delivered, "published");
        }
    }
}

/// Encodes and sends a server frame directly on a WebSocket sender.
async fn send_direct(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    server_frame: &ServerFrame,
) -> Result<(), String> {
    let text = frame::encode_server(server_frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Query string of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// Response of `POST /notify/{username}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponse {
    /// Number of subscriptions the notification reached.
    pub delivered: usize,
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<BrokerState>>,
) -> impl IntoResponse {
    let username = params
        .token
        .as_deref()
        .and_then(|token| state.authenticate(token));
    ws.on_upgrade(move |socket| handle_socket(socket, state, username))
}

/// Pushes a JSON notification to a user's connected sessions.
async fn notify_handler(
    State(state): State<Arc<BrokerState>>,
    Path(username): Path<String>,
    Json(notification): Json<serde_json::Value>,
) -> Result<Json<NotifyResponse>, (StatusCode, String)> {
    if !notification.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "notification must be a JSON object".to_string(),
        ));
    }
    let body = notification.to_string();
    let delivered = state.notify_user(&username, &body).await;
    tracing::info!(username = %username, delivered, "notification pushed");
    Ok(Json(NotifyResponse { delivered }))
}

/// Starts a broker with the given token table and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    tokens: TokenTable,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new(tokens))).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let body_limit = state.max_body_size;
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/notify/{username}", axum::routing::post(notify_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}
