// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connections and Channels over lapin
//!
//! This module implements the [`crate::transport`] traits with `lapin`: dialing the
//! broker, watching the connection for errors, and translating exchange, queue,
//! consume and publish operations into AMQP frames.

use crate::{
    config::RabbitMQOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    metadata::{HeaderValue, Metadata},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryAcker, DeliveryStream,
        InboundDelivery, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone)]
pub struct LapinTransport {
    uri: String,
    connection_name: String,
}

impl LapinTransport {
    pub fn new(options: &RabbitMQOptions) -> LapinTransport {
        LapinTransport {
            uri: options.uri(),
            connection_name: options.app_name.clone(),
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

/// A lapin connection whose errors are published on a watch channel.
pub struct LapinConnection {
    conn: Connection,
    errors: watch::Receiver<Option<AmqpError>>,
}

impl LapinConnection {
    fn new(conn: Connection) -> LapinConnection {
        let (tx, errors) = watch::channel(None);

        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            tx.send_replace(Some(AmqpError::ConnectionError(err.to_string())));
        });

        LapinConnection { conn, errors }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn closed(&self) -> AmqpError {
        let mut errors = self.errors.clone();
        let cause = match errors.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone(),
            Err(_) => None,
        };

        cause.unwrap_or(AmqpError::Disconnected)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exchange.name);

        match self
            .channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: exchange.passive,
                    durable: exchange.durable,
                    auto_delete: exchange.delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                },
                field_table(&exchange.params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exchange.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", exchange.name);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", queue.name);

        match self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.delete,
                    nowait: queue.no_wait,
                },
                field_table(&queue.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = queue.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(queue.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", queue.name);
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                field_table(&binding.params),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound_delivery(delivery)),
                Err(err) => Err(AmqpError::ChannelError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::ConfirmModeError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        let properties = basic_properties(&message);

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory,
                },
                &message.body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(AmqpError::PublishNotConfirmed),
            Ok(Confirmation::Ack(Some(_))) => {
                warn!(exchange, routing_key, "message was returned as unroutable");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publish confirmation");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

fn inbound_delivery(delivery: Delivery) -> InboundDelivery {
    let props = &delivery.properties;

    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        timestamp: *props.timestamp(),
        headers: props
            .headers()
            .as_ref()
            .map(|table| metadata(table.inner()))
            .unwrap_or_default(),
        acker: Arc::new(LapinAcker {
            acker: delivery.acker.clone(),
        }),
        body: delivery.data,
    }
}

fn basic_properties(message: &OutboundMessage) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_kind(ShortString::from(message.kind.clone()))
        .with_headers(field_table(message.headers.iter()))
        .with_delivery_mode(message.delivery_mode as u8)
        .with_timestamp(message.timestamp);

    if let Some(priority) = message.priority {
        props = props.with_priority(priority);
    }
    if let Some(expiration) = &message.expiration {
        props = props.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(app_id) = &message.app_id {
        props = props.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(reply_to) = &message.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(encoding) = &message.content_encoding {
        props = props.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if let Some(correlation_id) = &message.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(message_id) = &message.message_id {
        props = props.with_message_id(ShortString::from(message_id.clone()));
    }

    props
}

/// Converts header values to an AMQP field table.
fn field_table<'a>(values: impl IntoIterator<Item = (&'a String, &'a HeaderValue)>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in values {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table to metadata, skipping nested and binary values.
fn metadata(table: &BTreeMap<ShortString, AMQPValue>) -> Metadata {
    let mut metadata = Metadata::new();

    for (key, value) in table {
        let header = match value {
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::ShortInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::ShortUInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::LongInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::LongUInt(v) => HeaderValue::Int((*v).into()),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
            AMQPValue::Float(v) => HeaderValue::Float((*v).into()),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            _ => continue,
        };

        metadata.set(key.as_str(), header);
    }

    metadata
}
