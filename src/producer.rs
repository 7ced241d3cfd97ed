// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! Publishes messages with publisher confirms. Every publish opens its own
//! channel, declares the target exchange, waits for the broker confirmation and
//! closes the channel again, so a producer can be shared freely between tasks.
//! Trace context is propagated through the message headers.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Message, MessageType},
    metadata::Metadata,
    observer::{ProducedObserver, ProducedObservers},
    otel::{MessageTracer, SpanAttributes},
    producer_configuration::ProducerConfiguration,
    serializer::MessageSerializer,
    topology::{AmqpTopology, Topology},
    transport::{BrokerChannel, OutboundMessage},
};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, error, warn};

/// Publishes messages to RabbitMQ exchanges.
pub struct RabbitMQProducer {
    connection: Arc<ConnectionManager>,
    serializer: Arc<dyn MessageSerializer>,
    tracer: Arc<dyn MessageTracer>,
    configurations: RwLock<HashMap<MessageType, ProducerConfiguration>>,
    produced: ProducedObservers,
}

impl RabbitMQProducer {
    /// Creates a producer. Its produced observers also notify `observers`.
    pub fn new(
        connection: Arc<ConnectionManager>,
        serializer: Arc<dyn MessageSerializer>,
        tracer: Arc<dyn MessageTracer>,
        configurations: impl IntoIterator<Item = ProducerConfiguration>,
        observers: Arc<ProducedObservers>,
    ) -> RabbitMQProducer {
        RabbitMQProducer {
            connection,
            serializer,
            tracer,
            configurations: RwLock::new(
                configurations
                    .into_iter()
                    .map(|config| (config.message_type, config))
                    .collect(),
            ),
            produced: ProducedObservers::with_parent(observers),
        }
    }

    /// Configuration used for a message type, synthesized when none was registered.
    pub fn configuration_for(&self, message_type: MessageType) -> ProducerConfiguration {
        self.configurations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .cloned()
            .unwrap_or_else(|| ProducerConfiguration::for_type(message_type))
    }

    /// Adds or replaces the configuration of a message type.
    pub fn configure(&self, config: ProducerConfiguration) {
        self.configurations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.message_type, config);
    }

    /// Publishes a message to its configured exchange.
    pub async fn publish_message(
        &self,
        message: &dyn Message,
        metadata: Metadata,
    ) -> Result<(), AmqpError> {
        self.publish(message, metadata, None).await
    }

    /// Publishes a message to `exchange` instead of the configured exchange.
    /// An empty name falls back to the configuration.
    pub async fn publish_message_with_topic_name(
        &self,
        message: &dyn Message,
        metadata: Metadata,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.publish(message, metadata, Some(exchange)).await
    }

    /// Registers an observer called after every confirmed publish.
    pub fn is_produced(&self, observer: Arc<ProducedObserver>) {
        self.produced.register(observer);
    }

    async fn publish(
        &self,
        message: &dyn Message,
        mut metadata: Metadata,
        exchange_override: Option<&str>,
    ) -> Result<(), AmqpError> {
        if !self.connection.is_connected() {
            error!("failure to publish, rabbitmq is not connected");
            return Err(AmqpError::Disconnected);
        }

        let message_type = message.message_type();
        let config = self.configuration_for(message_type);
        let exchange = match exchange_override.filter(|name| !name.is_empty()) {
            Some(name) => config.exchange.clone().rename(name),
            None => config.exchange.clone(),
        };

        metadata.normalize(message, &self.serializer.content_type());

        let (payload, content_type) = self.serializer.serialize(message).map_err(|err| {
            error!(
                error = err.to_string(),
                message = message_type.name(),
                "failure to serialize message"
            );
            err
        })?;

        let correlation_id = metadata.correlation_id().unwrap_or_default().to_owned();
        let span = self.tracer.start_producer_span(
            &SpanAttributes {
                message_name: message_type.name(),
                message_id: message.message_id(),
                correlation_id: &correlation_id,
                destination: &exchange.name,
                payload: &payload,
            },
            &mut metadata,
        );

        let outbound = OutboundMessage {
            content_type,
            kind: message_type.name().to_owned(),
            body: payload,
            headers: metadata,
            delivery_mode: config.delivery_mode,
            priority: config.priority,
            expiration: config.expiration.clone(),
            app_id: config.app_id.clone(),
            reply_to: config.reply_to.clone(),
            content_encoding: config.content_encoding.clone(),
            correlation_id: Some(correlation_id),
            message_id: Some(message.message_id().to_owned()),
            timestamp: message.created().timestamp().max(0) as u64,
        };

        let result = self.send(&exchange, &config.routing_key, outbound).await;
        span.finish(result.as_ref().err());

        match &result {
            Ok(()) => {
                debug!(
                    message = message_type.name(),
                    exchange = exchange.name.as_str(),
                    routing_key = config.routing_key.as_str(),
                    "message published"
                );
                self.produced.notify(message);
            }
            Err(err) => error!(
                error = err.to_string(),
                message = message_type.name(),
                exchange = exchange.name.as_str(),
                "failure to publish message"
            ),
        }

        result
    }

    async fn send(
        &self,
        exchange: &ExchangeDefinition,
        routing_key: &str,
        outbound: OutboundMessage,
    ) -> Result<(), AmqpError> {
        let channel = self.connection.channel().await?;

        let result = publish_confirmed(channel.as_ref(), exchange, routing_key, outbound).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close publishing channel");
        }

        result
    }
}

async fn publish_confirmed(
    channel: &dyn BrokerChannel,
    exchange: &ExchangeDefinition,
    routing_key: &str,
    outbound: OutboundMessage,
) -> Result<(), AmqpError> {
    AmqpTopology::new(channel).exchange(exchange).install().await?;
    channel.confirm_select().await?;
    channel
        .basic_publish(&exchange.name, routing_key, true, outbound)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RabbitMQOptions,
        metadata::{HEADER_CORRELATION_ID, HEADER_MESSAGE_NAME},
        producer_configuration::ProducerConfigurationBuilder,
        serializer::{JsonMessageSerializer, MockMessageSerializer, JSON_CONTENT_TYPE},
        testing::{MemoryBroker, ProductCreatedV1, RecordingTracer},
        transport::DeliveryMode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn producer(
        broker: &Arc<MemoryBroker>,
        serializer: Arc<dyn MessageSerializer>,
        tracer: Arc<dyn MessageTracer>,
        configurations: Vec<ProducerConfiguration>,
    ) -> RabbitMQProducer {
        let connection = ConnectionManager::connect(
            broker.clone(),
            &RabbitMQOptions {
                auto_reconnect: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        RabbitMQProducer::new(
            connection,
            serializer,
            tracer,
            configurations,
            Arc::new(ProducedObservers::new()),
        )
    }

    fn json() -> Arc<dyn MessageSerializer> {
        Arc::new(JsonMessageSerializer::new().register::<ProductCreatedV1>())
    }

    #[tokio::test]
    async fn publishes_to_the_derived_exchange() {
        let broker = MemoryBroker::new();
        let tracer = Arc::new(RecordingTracer::default());
        let producer = producer(&broker, json(), tracer.clone(), vec![]).await;
        let message = ProductCreatedV1::new("p1", "Widget", 9.99);

        producer
            .publish_message(&message, Metadata::new())
            .await
            .unwrap();

        assert!(broker.has_exchange("product_created_v1"));
        let published = broker.published();
        assert_eq!(published.len(), 1);

        let outbound = &published[0];
        assert_eq!(outbound.kind, "ProductCreatedV1");
        assert_eq!(outbound.content_type, JSON_CONTENT_TYPE);
        assert_eq!(outbound.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(outbound.message_id.as_deref(), Some(message.id.as_str()));
        assert_eq!(
            outbound.headers.get_str(HEADER_MESSAGE_NAME),
            Some("ProductCreatedV1")
        );
        assert_eq!(
            outbound.correlation_id.as_deref(),
            outbound.headers.get_str(HEADER_CORRELATION_ID)
        );
        assert_eq!(outbound.headers.get_str("traceparent"), Some("00-trace-span-01"));

        let decoded: ProductCreatedV1 = serde_json::from_slice(&outbound.body).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(*tracer.finished.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn topic_name_overrides_the_configuration() {
        let broker = MemoryBroker::new();
        let config = ProducerConfigurationBuilder::for_message::<ProductCreatedV1>()
            .exchange_name("catalog")
            .priority(5)
            .build();
        let producer = producer(
            &broker,
            json(),
            Arc::new(RecordingTracer::default()),
            vec![config],
        )
        .await;
        let message = ProductCreatedV1::new("p1", "Widget", 9.99);

        producer
            .publish_message(&message, Metadata::new())
            .await
            .unwrap();
        producer
            .publish_message_with_topic_name(&message, Metadata::new(), "catalog-eu")
            .await
            .unwrap();

        assert!(broker.has_exchange("catalog"));
        assert!(broker.has_exchange("catalog-eu"));
        assert!(!broker.has_exchange("product_created_v1"));
        assert!(broker.published().iter().all(|m| m.priority == Some(5)));
    }

    #[tokio::test]
    async fn caller_metadata_is_kept() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            json(),
            Arc::new(RecordingTracer::default()),
            vec![],
        )
        .await;
        let mut metadata = Metadata::new();
        metadata.set(HEADER_CORRELATION_ID, "corr-42");
        metadata.set("tenant", "acme");

        producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), metadata)
            .await
            .unwrap();

        let outbound = &broker.published()[0];
        assert_eq!(outbound.correlation_id.as_deref(), Some("corr-42"));
        assert_eq!(outbound.headers.get_str("tenant"), Some("acme"));
    }

    #[tokio::test]
    async fn serializer_failure_aborts_before_any_channel_io() {
        let broker = MemoryBroker::new();
        let mut serializer = MockMessageSerializer::new();
        serializer
            .expect_content_type()
            .returning(|| JSON_CONTENT_TYPE.to_owned());
        serializer
            .expect_serialize()
            .times(1)
            .returning(|_| Err(AmqpError::SerializationError("boom".to_owned())));
        let tracer = Arc::new(RecordingTracer::default());
        let producer = producer(&broker, Arc::new(serializer), tracer.clone(), vec![]).await;

        let result = producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new())
            .await;

        assert_eq!(
            result,
            Err(AmqpError::SerializationError("boom".to_owned()))
        );
        assert!(!broker.has_exchange("product_created_v1"));
        assert!(broker.published().is_empty());
        assert!(tracer.finished.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exchange_declaration_failure_is_returned() {
        let broker = MemoryBroker::new();
        let tracer = Arc::new(RecordingTracer::default());
        let producer = producer(&broker, json(), tracer.clone(), vec![]).await;

        let channel = producer.connection.channel().await.unwrap();
        channel
            .exchange_declare(&ExchangeDefinition::new("product_created_v1").fanout())
            .await
            .unwrap();
        channel.close().await.unwrap();

        let result = producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new())
            .await;

        assert!(matches!(result, Err(AmqpError::DeclareExchangeError(_))));
        assert!(broker.published().is_empty());
        let finished = tracer.finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 1);
        assert!(finished[0]
            .as_deref()
            .is_some_and(|err| err.starts_with("failure to declare an exchange")));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn nacked_confirmation_is_not_confirmed() {
        let broker = MemoryBroker::new();
        let tracer = Arc::new(RecordingTracer::default());
        let producer = producer(&broker, json(), tracer.clone(), vec![]).await;
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        producer.is_produced(Arc::new(move |_: &dyn Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.set_nack_confirms(true);
        let result = producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new())
            .await;

        assert_eq!(result, Err(AmqpError::PublishNotConfirmed));
        assert_eq!(
            *tracer.finished.lock().unwrap(),
            vec![Some(AmqpError::PublishNotConfirmed.to_string())]
        );
        assert_eq!(produced.load(Ordering::SeqCst), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn every_publish_closes_its_channel() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            json(),
            Arc::new(RecordingTracer::default()),
            vec![],
        )
        .await;
        let message = ProductCreatedV1::new("p1", "Widget", 9.99);

        producer
            .publish_message(&message, Metadata::new())
            .await
            .unwrap();
        assert_eq!(broker.open_channels(), 0);

        broker.set_nack_confirms(true);
        assert!(producer
            .publish_message(&message, Metadata::new())
            .await
            .is_err());
        assert_eq!(broker.open_channels(), 0);

        broker.set_nack_confirms(false);
        producer
            .publish_message_with_topic_name(&message, Metadata::new(), "catalog")
            .await
            .unwrap();
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn disconnected_producer_fails_fast() {
        let broker = MemoryBroker::new();
        let producer = producer(
            &broker,
            json(),
            Arc::new(RecordingTracer::default()),
            vec![],
        )
        .await;
        broker.drop_connections();
        assert!(
            crate::testing::eventually(std::time::Duration::from_secs(1), || !producer
                .connection
                .is_connected())
            .await
        );

        let result = producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new())
            .await;

        assert_eq!(result, Err(AmqpError::Disconnected));
    }

    #[tokio::test]
    async fn observers_see_confirmed_messages_only() {
        let broker = MemoryBroker::new();
        let parent = Arc::new(ProducedObservers::new());
        let connection = ConnectionManager::connect(broker.clone(), &RabbitMQOptions::default())
            .await
            .unwrap();
        let producer = RabbitMQProducer::new(
            connection,
            Arc::new(JsonMessageSerializer::new()),
            Arc::new(RecordingTracer::default()),
            vec![],
            parent.clone(),
        );

        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        parent.register(Arc::new(move |message: &dyn Message| {
            assert!(message.downcast_ref::<ProductCreatedV1>().is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // nothing registered in the serializer: the publish fails
        let failed = producer
            .publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new())
            .await;
        assert!(matches!(failed, Err(AmqpError::UnregisteredMessageType(_))));
        assert_eq!(produced.load(Ordering::SeqCst), 0);

        producer.configure(ProducerConfiguration::for_message::<ProductCreatedV1>());
        let producer = RabbitMQProducer {
            serializer: json(),
            ..producer
        };
        producer
            .publish_message(&ProductCreatedV1::new("p2", "Gadget", 1.5), Metadata::new())
            .await
            .unwrap();
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }
}
