// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bus
//!
//! Entry point of the crate. A bus owns the shared connection, one producer and
//! the consumers registered per message type, and exposes them through a single
//! start / stop / publish surface.
//!
//! ```ignore
//! let serializer = JsonMessageSerializer::new().register::<ProductCreatedV1>();
//! let bus = RabbitMQBus::new(config, Arc::new(serializer)).await?;
//!
//! bus.connect_consumer_handler::<ProductCreatedV1>(Arc::new(handler_fn(|ctx| async move {
//!     let product = ctx.message_as::<ProductCreatedV1>();
//!     Ok(())
//! })));
//! bus.start().await?;
//! bus.publish_message(&ProductCreatedV1::new("p1", "Widget", 9.99), Metadata::new()).await?;
//! ```

use crate::{
    bus_configuration::RabbitMQBusConfiguration,
    channel::LapinTransport,
    connection::ConnectionManager,
    consumer::RabbitMQConsumer,
    consumer_configuration::{ConsumerConfiguration, ConsumerConfigurationBuilder},
    errors::AmqpError,
    handler::ConsumerHandler,
    message::{Message, MessageType},
    metadata::Metadata,
    observer::{ConsumedObserver, ConsumedObservers, ProducedObserver, ProducedObservers},
    otel::{MessageTracer, OtelMessageTracer},
    producer::RabbitMQProducer,
    serializer::MessageSerializer,
    shutdown::{shutdown_channel, ShutdownTrigger},
    transport::Transport,
};
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, error, warn};

/// Producer and consumers sharing one broker connection.
pub struct RabbitMQBus {
    connection: Arc<ConnectionManager>,
    serializer: Arc<dyn MessageSerializer>,
    tracer: Arc<dyn MessageTracer>,
    producer: RabbitMQProducer,
    consumers: RwLock<HashMap<MessageType, Vec<Arc<RabbitMQConsumer>>>>,
    produced: Arc<ProducedObservers>,
    consumed: Arc<ConsumedObservers>,
    shutdown: ShutdownTrigger,
}

impl RabbitMQBus {
    /// Connects to the broker described by the configuration options.
    pub async fn new(
        config: RabbitMQBusConfiguration,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Result<RabbitMQBus, AmqpError> {
        let transport = Arc::new(LapinTransport::new(&config.options));
        RabbitMQBus::with_transport(config, transport, serializer, Arc::new(OtelMessageTracer::new()))
            .await
    }

    /// Creates a bus over any transport and tracer.
    pub async fn with_transport(
        config: RabbitMQBusConfiguration,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn MessageSerializer>,
        tracer: Arc<dyn MessageTracer>,
    ) -> Result<RabbitMQBus, AmqpError> {
        let connection = ConnectionManager::connect(transport, &config.options).await?;
        let produced = Arc::new(ProducedObservers::new());
        let consumed = Arc::new(ConsumedObservers::new());

        let producer = RabbitMQProducer::new(
            connection.clone(),
            serializer.clone(),
            tracer.clone(),
            config.producers,
            produced.clone(),
        );

        let (shutdown, _) = shutdown_channel();
        let bus = RabbitMQBus {
            connection,
            serializer,
            tracer,
            producer,
            consumers: RwLock::new(HashMap::new()),
            produced,
            consumed,
            shutdown,
        };

        for consumer in config.consumers {
            bus.connect_consumer(consumer);
        }

        if config.options.auto_start {
            bus.start().await?;
        }

        Ok(bus)
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn producer(&self) -> &RabbitMQProducer {
        &self.producer
    }

    /// Starts every registered consumer.
    ///
    /// A consumer failing because the connection is down is skipped: it
    /// subscribes on its own once the connection is back. Any other failure stops
    /// every consumer, skipped ones included, and is returned.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let consumers = self.all_consumers();
        let mut started = 0;

        for consumer in &consumers {
            match consumer.start(self.shutdown.subscribe()).await {
                Ok(()) => started += 1,
                Err(err) if err.is_disconnection() => warn!(
                    error = err.to_string(),
                    consumer = consumer.configuration().name(),
                    "consumer will start once the connection is restored"
                ),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        consumer = consumer.configuration().name(),
                        "failure to start consumer, stopping the bus"
                    );
                    join_all(consumers.iter().map(|consumer| consumer.stop())).await;
                    return Err(err);
                }
            }
        }

        debug!(consumers = started, "bus started");
        Ok(())
    }

    /// Stops every consumer concurrently and waits for all of them.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let consumers = self.all_consumers();
        let results = join_all(consumers.iter().map(|consumer| consumer.stop())).await;

        debug!(consumers = consumers.len(), "bus stopped");
        results.into_iter().collect()
    }

    /// Stops the consumers and closes the connection. The bus is unusable afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let stopped = self.stop().await;
        self.shutdown.trigger();
        self.connection.close().await?;
        stopped
    }

    pub async fn publish_message(
        &self,
        message: &dyn Message,
        metadata: Metadata,
    ) -> Result<(), AmqpError> {
        self.producer.publish_message(message, metadata).await
    }

    pub async fn publish_message_with_topic_name(
        &self,
        message: &dyn Message,
        metadata: Metadata,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.producer
            .publish_message_with_topic_name(message, metadata, exchange)
            .await
    }

    /// Adds a consumer for the configured message type.
    ///
    /// Consumers added after [`RabbitMQBus::start`] run from the next start.
    pub fn connect_consumer(&self, config: ConsumerConfiguration) -> Arc<RabbitMQConsumer> {
        let consumer = RabbitMQConsumer::new(
            config,
            self.connection.clone(),
            self.serializer.clone(),
            self.tracer.clone(),
            self.consumed.clone(),
        );

        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(consumer.message_type())
            .or_default()
            .push(consumer.clone());

        consumer
    }

    /// Attaches a handler to the first consumer of `T`, creating a default
    /// consumer when there is none.
    pub fn connect_consumer_handler<T: Message>(
        &self,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Arc<RabbitMQConsumer> {
        let message_type = MessageType::of::<T>();
        let existing = self
            .consumers_for(&message_type)
            .into_iter()
            .next();

        match existing {
            Some(consumer) => {
                consumer.connect_handler(handler);
                consumer
            }
            None => self.connect_consumer(
                ConsumerConfigurationBuilder::new(message_type)
                    .handler(handler)
                    .build(),
            ),
        }
    }

    pub fn consumers_for(&self, message_type: &MessageType) -> Vec<Arc<RabbitMQConsumer>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Registers an observer of every consumption attempt of every consumer.
    pub fn is_consumed(&self, observer: Arc<ConsumedObserver>) {
        self.consumed.register(observer);
    }

    /// Registers an observer of every confirmed publish.
    pub fn is_produced(&self, observer: Arc<ProducedObserver>) {
        self.produced.register(observer);
    }

    fn all_consumers(&self) -> Vec<Arc<RabbitMQConsumer>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}
