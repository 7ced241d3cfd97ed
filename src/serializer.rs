// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Serialization
//!
//! The bus never encodes payloads itself; it goes through a [`MessageSerializer`].
//! [`JsonMessageSerializer`] is the default implementation: a registry of message
//! types keyed by their short type name, which is the name sent in the AMQP `type`
//! property.

use crate::{errors::AmqpError, message::Message, message::MessageType};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes outgoing messages and decodes incoming payloads.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSerializer: Send + Sync {
    /// Encodes a message, returning the payload and its content type.
    fn serialize(&self, message: &dyn Message) -> Result<(Vec<u8>, String), AmqpError>;

    /// Decodes a payload for the given short type name.
    fn deserialize(
        &self,
        payload: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<Arc<dyn Message>, AmqpError>;

    /// Content type produced by `serialize`.
    fn content_type(&self) -> String;
}

type SerializeFn = fn(&dyn Message) -> Result<Vec<u8>, AmqpError>;
type DeserializeFn = fn(&[u8]) -> Result<Arc<dyn Message>, AmqpError>;

#[derive(Clone, Copy)]
struct Codec {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

/// JSON serializer backed by `serde_json`.
///
/// Only registered types can be (de)serialized. Types sharing a short name
/// overwrite each other, the last registration wins.
#[derive(Clone, Default)]
pub struct JsonMessageSerializer {
    codecs: HashMap<&'static str, Codec>,
}

impl JsonMessageSerializer {
    pub fn new() -> JsonMessageSerializer {
        JsonMessageSerializer::default()
    }

    /// Registers a message type.
    pub fn register<T>(mut self) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        self.codecs.insert(
            MessageType::of::<T>().name(),
            Codec {
                serialize: encode::<T>,
                deserialize: decode::<T>,
            },
        );
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }

    fn codec(&self, type_name: &str) -> Result<Codec, AmqpError> {
        self.codecs
            .get(type_name)
            .copied()
            .ok_or_else(|| AmqpError::UnregisteredMessageType(type_name.to_owned()))
    }
}

fn encode<T>(message: &dyn Message) -> Result<Vec<u8>, AmqpError>
where
    T: Message + Serialize,
{
    let Some(typed) = message.downcast_ref::<T>() else {
        return Err(AmqpError::SerializationError(format!(
            "expected `{}`",
            MessageType::of::<T>()
        )));
    };

    serde_json::to_vec(typed).map_err(|err| AmqpError::SerializationError(err.to_string()))
}

fn decode<T>(payload: &[u8]) -> Result<Arc<dyn Message>, AmqpError>
where
    T: Message + DeserializeOwned,
{
    let message: T = serde_json::from_slice(payload)
        .map_err(|err| AmqpError::DeserializationError(err.to_string()))?;
    Ok(Arc::new(message))
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, message: &dyn Message) -> Result<(Vec<u8>, String), AmqpError> {
        let codec = self.codec(message.message_type().name())?;
        let payload = (codec.serialize)(message)?;
        Ok((payload, JSON_CONTENT_TYPE.to_owned()))
    }

    fn deserialize(
        &self,
        payload: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<Arc<dyn Message>, AmqpError> {
        if !content_type.is_empty() && content_type != JSON_CONTENT_TYPE {
            return Err(AmqpError::DeserializationError(format!(
                "unsupported content type `{}`",
                content_type
            )));
        }

        let codec = self.codec(type_name)?;
        (codec.deserialize)(payload)
    }

    fn content_type(&self) -> String {
        JSON_CONTENT_TYPE.to_owned()
    }
}
