//! JSON encoding and decoding for the Fluxsend wire protocol.
//!
//! Decoding is two-step: [`decode`] only validates the envelope (a JSON
//! object with a string `type`), and [`Inbound::body`] parses the typed
//! request for the kinds the server actually interprets. Opaque kinds are
//! never parsed past the envelope.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::message::{MessageKind, ServerMessage};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(String),
    /// Frame is valid JSON but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,
    /// The `type` discriminator is missing or not a string.
    #[error("message is missing a string \"type\" field")]
    MissingType,
    /// A typed body failed to parse.
    #[error("invalid {kind} message: {reason}")]
    InvalidBody {
        /// Discriminator of the offending message.
        kind: String,
        /// What went wrong.
        reason: String,
    },
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Message discriminator.
    pub kind: MessageKind,
    fields: Map<String, Value>,
}

impl Inbound {
    /// Parses the typed body for this message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidBody`] if required fields are missing or
    /// have the wrong type.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            CodecError::InvalidBody {
                kind: self.kind.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Returns a raw field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Decodes the envelope of a text frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the text is not a JSON object with a string
/// `type` field.
pub fn decode(text: &str) -> Result<Inbound, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(CodecError::NotAnObject);
    };
    let kind = match fields.get("type") {
        Some(Value::String(ty)) => MessageKind::from_type(ty),
        _ => return Err(CodecError::MissingType),
    };
    Ok(Inbound { kind, fields })
}

/// Encodes a [`ServerMessage`] as a JSON string.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the message cannot be serialized.
pub fn encode(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}
