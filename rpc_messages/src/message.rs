/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The message envelope exchanged between workers, and the codec that
//! moves typed payloads in and out of it.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// The kinds of messages exchanged by workers.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString
)]
#[strum(serialize_all = "snake_case")]
pub enum MessageType {
    /// Run a script function and reply with its value.
    ScriptCall,
    /// The value produced by a `ScriptCall`.
    ScriptRet,
    /// Run a script function, keeping its value on the callee as the owner
    /// of a remote reference.
    ScriptRemoteCall,
    /// Acknowledges a `ScriptRemoteCall`; confirms the caller's reference.
    RemoteRet,
    /// The request failed on the callee.
    Exception,
}

impl MessageType {
    /// Whether messages of this kind are sent in reply to another message.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::ScriptRet | MessageType::RemoteRet | MessageType::Exception
        )
    }

    pub fn is_request(&self) -> bool {
        !self.is_response()
    }
}

/// Errors produced when encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload could not be (de)serialized.
    #[error(transparent)]
    Codec(#[from] bincode::Error),

    /// The message is not of the kind the decoder expects.
    #[error("expected a {expected} message, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// A message: its kind, a request id used to correlate responses, and an
/// encoded payload.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    kind: MessageType,
    id: u64,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            id: 0,
            payload,
        }
    }

    /// An exception reply carrying the given error text.
    pub fn exception(what: impl Into<String>) -> Self {
        let what: String = what.into();
        // Encoding a string cannot fail.
        let payload = bincode::serialize(&what).unwrap_or_default();
        Self::new(MessageType::Exception, payload)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_exception(&self) -> bool {
        self.kind == MessageType::Exception
    }

    /// The error text of an exception message.
    pub fn exception_text(&self) -> Option<String> {
        if !self.is_exception() {
            return None;
        }
        Some(
            bincode::deserialize::<String>(&self.payload)
                .unwrap_or_else(|err| format!("undecodable exception: {}", err)),
        )
    }

    /// Encode the whole envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an envelope produced by [`Message::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A typed payload of a [`Message`] of a fixed kind.
pub trait RpcCommand: Serialize + DeserializeOwned + Sized {
    /// The message kind that carries this payload.
    const KIND: MessageType;

    /// Consume the payload into a message.
    fn into_message(self) -> Result<Message, MessageError> {
        Ok(Message::new(Self::KIND, bincode::serialize(&self)?))
    }

    /// Decode the payload of `message`, which must be of kind [`Self::KIND`].
    fn from_message(message: &Message) -> Result<Self, MessageError> {
        if message.kind() != Self::KIND {
            return Err(MessageError::UnexpectedType {
                expected: Self::KIND,
                actual: message.kind(),
            });
        }
        Ok(bincode::deserialize(message.payload())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception() {
        let message = Message::exception("boom");
        assert!(message.is_exception());
        assert!(message.kind().is_response());
        assert_eq!(message.exception_text().as_deref(), Some("boom"));

        let other = Message::new(MessageType::ScriptCall, vec![]);
        assert_eq!(other.exception_text(), None);
        assert!(other.kind().is_request());
    }

    #[test]
    fn test_envelope_bytes() {
        let mut message = Message::new(MessageType::RemoteRet, vec![1, 2, 3]);
        message.set_id(42);
        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.id(), 42);
        assert!(Message::from_bytes(&[0xff]).is_err());
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::ScriptRemoteCall.to_string(), "script_remote_call");
        assert_eq!(
            "remote_ret".parse::<MessageType>().unwrap(),
            MessageType::RemoteRet
        );
    }
}
