// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Bus
//!
//! `AmqpError` covers every failure the bus can surface: connection and channel
//! problems, topology declarations, publishing, (de)serialization, acknowledgement
//! and the consumer lifecycle. Business handlers report failures through the
//! boxed [`HandlerError`] instead, which never crosses the consumer boundary.

use thiserror::Error;

/// Error type returned by consumer handlers and pipelines.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The shared connection is down or was closed
    #[error("connection is not available")]
    Disconnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error switching a channel into publisher-confirm mode
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmModeError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker nacked the publish or never confirmed it
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmed,

    /// Error serializing an outgoing message
    #[error("failure to serialize message `{0}`")]
    SerializationError(String),

    /// Error deserializing an incoming payload
    #[error("failure to parse payload `{0}`")]
    DeserializationError(String),

    /// No codec was registered for the message type
    #[error("message type `{0}` is not registered")]
    UnregisteredMessageType(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// A handler or pipeline failed after all retry attempts
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// Retrying was interrupted by shutdown
    #[error("retry cancelled")]
    RetryCancelled,
}

impl AmqpError {
    /// Reports whether the error comes from a lost connection or channel, which
    /// the reconnect loop recovers from on its own.
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) | AmqpError::Disconnected
        )
    }
}
