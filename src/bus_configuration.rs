// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Configuration
//!
//! Connection options plus the producer and consumer configurations the bus is
//! created with, assembled through [`RabbitMQBusConfigurationBuilder`]:
//!
//! ```ignore
//! let config = RabbitMQBusConfigurationBuilder::new(options)
//!     .add_producer::<ProductCreatedV1>(|p| p.exchange_name("catalog"))
//!     .add_consumer::<ProductCreatedV1>(|c| c.queue_name("search-indexer").concurrency_limit(4))
//!     .build();
//! ```

use crate::{
    config::RabbitMQOptions,
    consumer_configuration::{ConsumerConfiguration, ConsumerConfigurationBuilder},
    message::Message,
    producer_configuration::{ProducerConfiguration, ProducerConfigurationBuilder},
};

/// Everything needed to create a bus.
#[derive(Debug, Clone)]
pub struct RabbitMQBusConfiguration {
    pub(crate) options: RabbitMQOptions,
    pub(crate) producers: Vec<ProducerConfiguration>,
    pub(crate) consumers: Vec<ConsumerConfiguration>,
}

impl RabbitMQBusConfiguration {
    pub fn options(&self) -> &RabbitMQOptions {
        &self.options
    }

    pub fn producers(&self) -> &[ProducerConfiguration] {
        &self.producers
    }

    pub fn consumers(&self) -> &[ConsumerConfiguration] {
        &self.consumers
    }
}

pub struct RabbitMQBusConfigurationBuilder {
    config: RabbitMQBusConfiguration,
}

impl RabbitMQBusConfigurationBuilder {
    pub fn new(options: RabbitMQOptions) -> RabbitMQBusConfigurationBuilder {
        RabbitMQBusConfigurationBuilder {
            config: RabbitMQBusConfiguration {
                options,
                producers: vec![],
                consumers: vec![],
            },
        }
    }

    /// Configures how `T` is published. A later call for the same type wins.
    pub fn add_producer<T: Message>(
        mut self,
        configure: impl FnOnce(ProducerConfigurationBuilder) -> ProducerConfigurationBuilder,
    ) -> Self {
        let producer = configure(ProducerConfigurationBuilder::for_message::<T>()).build();
        self.config
            .producers
            .retain(|existing| existing.message_type != producer.message_type);
        self.config.producers.push(producer);
        self
    }

    /// Adds a consumer of `T`. Every call adds another consumer.
    pub fn add_consumer<T: Message>(
        mut self,
        configure: impl FnOnce(ConsumerConfigurationBuilder) -> ConsumerConfigurationBuilder,
    ) -> Self {
        let consumer = configure(ConsumerConfigurationBuilder::for_message::<T>()).build();
        self.config.consumers.push(consumer);
        self
    }

    pub fn build(self) -> RabbitMQBusConfiguration {
        self.config
    }
}
