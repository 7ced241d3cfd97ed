// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The narrow set of AMQP 0-9-1 operations the bus relies on. The connection
//! manager, consumers and producer only talk to the broker through these traits;
//! [`crate::channel`] implements them on top of `lapin`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    metadata::Metadata,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries produced by `basic_consume`. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Delivery mode of a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    NonPersistent = 1,
    #[default]
    Persistent = 2,
}

/// Settles deliveries with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// One message handed from the broker to a consumer.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    /// Short message type name (AMQP `type` property)
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub headers: Metadata,
    pub body: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl InboundDelivery {
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("kind", &self.kind)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

/// Properties and body of a message about to be published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub content_type: String,
    /// Short message type name (AMQP `type` property)
    pub kind: String,
    pub body: Vec<u8>,
    pub headers: Metadata,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub app_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// Flags for `basic_consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// An open AMQP channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message. In confirm mode this resolves once the broker confirmed it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    /// Resolves with the cause once the connection is lost unexpectedly.
    async fn closed(&self) -> AmqpError;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
