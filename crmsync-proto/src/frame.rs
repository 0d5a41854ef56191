//! WebSocket frame types and their JSON codec.
//!
//! Every WebSocket text frame carries exactly one [`ClientFrame`] (client to
//! broker) or [`ServerFrame`] (broker to client), encoded as a JSON object
//! tagged by `type`. Payloads travel in `body` as a JSON document serialized
//! to a string, so the transport never needs to know the payload schema.

use serde::{Deserialize, Serialize};

use crate::topic::SubscriptionId;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Frames sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Start receiving messages published on `destination`.
    Subscribe {
        /// Client-chosen id echoed back on every delivery.
        id: SubscriptionId,
        /// Broker destination, e.g. `/topic/tasks/7/chat`.
        destination: String,
    },
    /// Stop a subscription previously opened with the same id.
    Unsubscribe {
        /// Id given at subscribe time.
        id: SubscriptionId,
    },
    /// Publish a payload on a destination. Fire-and-forget.
    Send {
        /// Broker destination.
        destination: String,
        /// JSON document serialized as a string.
        body: String,
    },
}

/// Frames sent by the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Handshake completed; the token was accepted for `username`.
    Connected {
        /// The authenticated user.
        username: String,
    },
    /// A payload delivered on one of the client's subscriptions.
    Message {
        /// The subscription this delivery belongs to.
        subscription: SubscriptionId,
        /// The destination the payload was published on.
        destination: String,
        /// JSON document serialized as a string.
        body: String,
    },
    /// The broker rejected something. During the handshake this is fatal.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Encodes a [`ClientFrame`] as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a [`ClientFrame`] from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the text is not a valid frame.
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a [`ServerFrame`] as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a [`ServerFrame`] from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the text is not a valid frame.
pub fn decode_server(text: &str) -> Result<ServerFrame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Serializes a payload into a frame body.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the payload cannot be serialized.
pub fn encode_body<T: Serialize>(payload: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(payload)?)
}

/// Deserializes a frame body into a payload type.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the body does not match `T`.
pub fn decode_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(body)?)
}
