//! The authenticated real-time session.
//!
//! A [`Session`] owns at most one live connection to the broker and
//! multiplexes topics over it. Outbound frames go through an unbounded
//! channel drained by a single writer task, so `subscribe`, `unsubscribe`
//! and `publish` never suspend. A single reader task routes inbound
//! deliveries through the [`SubscriptionRegistry`] in transport order.
//!
//! If the connection drops underneath, the reader task clears the registry
//! and moves the state to [`ConnectionState::Disconnected`]; callers watch
//! the state channel and reconnect explicitly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crmsync_proto::frame::{self, ClientFrame, CodecError, ServerFrame};
use crmsync_proto::notification::Notification;
use crmsync_proto::topic::{SubscriptionId, Topic};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::credentials::Credentials;
use crate::registry::{Acquired, Handler, SubscriptionRegistry};
use crate::transport::{Connector, Transport, TransportError};

/// How long `disconnect` waits for the writer to flush the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of the session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Opening the connection failed; the state is back to `Disconnected`.
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// No token/username is stored.
    #[error("no credentials stored")]
    MissingCredentials,

    /// A payload could not be encoded.
    #[error("payload encoding failed: {0}")]
    Codec(#[from] CodecError),
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

/// Handles of one live connection.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn enqueue(&self, frame: ClientFrame) -> Result<(), SessionError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SessionError::NotConnected)
    }
}

type LinkSlot = Arc<parking_lot::Mutex<Option<Link>>>;

/// One authenticated real-time session.
///
/// Constructed explicitly and passed by reference to its consumers.
pub struct Session<C: Connector> {
    connector: C,
    credentials: Credentials,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: LinkSlot,
    connect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl<C: Connector> Session<C> {
    /// Create a disconnected session.
    pub fn new(connector: C, credentials: Credentials) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            credentials,
            registry: Arc::new(SubscriptionRegistry::new()),
            state: Arc::new(state),
            link: Arc::new(parking_lot::Mutex::new(None)),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Open the connection and subscribe the user's notification feed.
    ///
    /// Well-formed notification pushes are handed to `on_notification`;
    /// malformed ones are logged and dropped. Calls are serialized, and a
    /// call while already connected returns `Ok(())` without doing anything.
    ///
    /// # Errors
    ///
    /// - [`SessionError::MissingCredentials`] if nobody is logged in.
    /// - [`SessionError::Connection`] if the connector fails; the state
    ///   returns to `Disconnected` and the caller may retry.
    pub async fn connect<F>(&self, on_notification: F) -> Result<(), SessionError>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let _serialized = self.connect_lock.lock().await;

        if self.link.lock().is_some() {
            tracing::debug!("connect while connected, ignoring");
            return Ok(());
        }

        let (token, username) = self
            .credentials
            .login()
            .ok_or(SessionError::MissingCredentials)?;

        self.state.send_replace(ConnectionState::Connecting);
        let transport = match self.connector.connect(&token).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::warn!(username = %username, error = %e, "connect failed");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(SessionError::Connection(e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.link.lock();
            let writer = tokio::spawn(writer_loop(Arc::clone(&transport), outbound_rx));
            let reader = tokio::spawn(reader_loop(
                transport,
                generation,
                Arc::clone(&self.registry),
                Arc::clone(&self.state),
                Arc::clone(&self.link),
            ));
            *slot = Some(Link {
                generation,
                outbound,
                reader,
                writer,
            });
            self.state.send_replace(ConnectionState::Connected);
        }
        tracing::info!(username = %username, "session connected");

        self.subscribe_json(Topic::UserNotificationFeed(username), on_notification)?;
        Ok(())
    }

    /// Close the connection and drop every subscription. Idempotent.
    pub async fn disconnect(&self) {
        let _serialized = self.connect_lock.lock().await;

        let link = self.link.lock().take();
        if let Some(link) = link {
            link.reader.abort();
            let _ = link.outbound.send(Outbound::Close);
            let mut writer = link.writer;
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
            tracing::info!("session disconnected");
        }
        self.registry.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Subscribe `topic`, delivering raw JSON bodies to `handler`.
    ///
    /// If the topic is already subscribed, the existing subscription is
    /// returned and `handler` is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] without a live connection, or
    /// if the `SUBSCRIBE` frame could not be queued (the entry is rolled back).
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Result<Acquired, SessionError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler))
    }

    /// Subscribe `topic`, decoding each body as `T`.
    ///
    /// Bodies that do not decode are logged at `warn` and dropped; the
    /// subscription stays live.
    ///
    /// # Errors
    ///
    /// Same as [`Session::subscribe`].
    pub fn subscribe_json<T, F>(&self, topic: Topic, handler: F) -> Result<Acquired, SessionError>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let label = topic.to_string();
        self.subscribe(topic, move |body: &str| match frame::decode_body::<T>(body) {
            Ok(payload) => handler(payload),
            Err(e) => tracing::warn!(topic = %label, error = %e, "malformed payload dropped"),
        })
    }

    /// Subscribe `topic` for the lifetime of the returned guard.
    ///
    /// The guard only unsubscribes on drop if this call created the
    /// subscription.
    ///
    /// # Errors
    ///
    /// Same as [`Session::subscribe`].
    pub fn subscribe_scoped<F>(&self, topic: Topic, handler: F) -> Result<TopicGuard<'_, C>, SessionError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let acquired = self.subscribe(topic.clone(), handler)?;
        Ok(TopicGuard {
            session: self,
            topic,
            acquired,
        })
    }

    fn subscribe_handler(&self, topic: Topic, handler: Handler) -> Result<Acquired, SessionError> {
        let slot = self.link.lock();
        let link = slot.as_ref().ok_or(SessionError::NotConnected)?;

        let acquired = self.registry.acquire(topic.clone(), handler);
        if let Acquired::Created(id) = acquired {
            let destination = topic.destination();
            if let Err(e) = link.enqueue(ClientFrame::Subscribe { id, destination }) {
                self.registry.release(&topic);
                tracing::warn!(topic = %topic, "subscribe frame not queued, rolled back");
                return Err(e);
            }
            tracing::debug!(topic = %topic, subscription = %id, "subscribed");
        }
        Ok(acquired)
    }

    /// Release `topic`. Unknown topics are a no-op.
    ///
    /// Returns the released subscription id, if there was one.
    pub fn unsubscribe(&self, topic: &Topic) -> Option<SubscriptionId> {
        let slot = self.link.lock();
        let id = self.registry.release(topic)?;
        if let Some(link) = slot.as_ref()
            && link.enqueue(ClientFrame::Unsubscribe { id }).is_err()
        {
            tracing::debug!(topic = %topic, "unsubscribe frame not queued");
        }
        tracing::debug!(topic = %topic, subscription = %id, "unsubscribed");
        Some(id)
    }

    /// Publish `payload` as JSON on `topic`. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Codec`] if the payload cannot be serialized.
    /// - [`SessionError::NotConnected`] without a live connection.
    pub fn publish<T: Serialize>(&self, topic: &Topic, payload: &T) -> Result<(), SessionError> {
        let body = frame::encode_body(payload)?;
        let slot = self.link.lock();
        let link = slot.as_ref().ok_or(SessionError::NotConnected)?;
        link.enqueue(ClientFrame::Send {
            destination: topic.destination(),
            body,
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The registry of active subscriptions.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The credential store this session reads at connect time.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().take() {
            link.reader.abort();
            let _ = link.outbound.send(Outbound::Close);
        }
    }
}

/// RAII subscription: unsubscribes its topic on drop.
pub struct TopicGuard<'a, C: Connector> {
    session: &'a Session<C>,
    topic: Topic,
    acquired: Acquired,
}

impl<C: Connector> TopicGuard<'_, C> {
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.acquired.id()
    }
}

impl<C: Connector> Drop for TopicGuard<'_, C> {
    fn drop(&mut self) {
        if self.acquired.is_new() && self.session.registry.id_of(&self.topic) == Some(self.id()) {
            self.session.unsubscribe(&self.topic);
        }
    }
}

async fn writer_loop<T: Transport>(transport: Arc<T>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if let Err(e) = transport.send(&frame).await {
                    tracing::warn!(error = %e, "frame not sent, writer exiting");
                    break;
                }
            }
            Outbound::Close => {
                transport.close().await;
                break;
            }
        }
    }
}

async fn reader_loop<T: Transport>(
    transport: Arc<T>,
    generation: u64,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: LinkSlot,
) {
    loop {
        match transport.recv().await {
            Ok(ServerFrame::Message {
                subscription,
                destination,
                body,
            }) => {
                if !registry.deliver(subscription, &body) {
                    tracing::debug!(
                        subscription = %subscription,
                        destination = %destination,
                        "delivery for released subscription dropped"
                    );
                }
            }
            Ok(ServerFrame::Error { message }) => {
                tracing::warn!(reason = %message, "broker error");
            }
            Ok(ServerFrame::Connected { username }) => {
                tracing::debug!(username = %username, "duplicate CONNECTED ignored");
            }
            Err(e) => {
                tracing::info!(error = %e, "connection lost");
                break;
            }
        }
    }

    let current = {
        let mut slot = link.lock();
        if slot.as_ref().is_some_and(|l| l.generation == generation) {
            slot.take()
        } else {
            None
        }
    };
    if let Some(current) = current {
        current.writer.abort();
        registry.clear();
        state.send_replace(ConnectionState::Disconnected);
    }
}
