// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Collects the exchanges, queues and bindings a participant needs and declares
//! them on a channel, in that order. Every declaration is idempotent, so
//! installing the same topology again after a reconnect is harmless.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation over a [`BrokerChannel`]

use crate::{
    consumer_configuration::ConsumerConfiguration,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings. Stops at the first failure.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology declared through a broker channel.
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn BrokerChannel,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn BrokerChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Exchange, queue and binding of a consumer.
    pub fn for_consumer(
        channel: &'tp dyn BrokerChannel,
        config: &'tp ConsumerConfiguration,
    ) -> AmqpTopology<'tp> {
        AmqpTopology::new(channel)
            .exchange(&config.exchange)
            .queue(&config.queue)
            .queue_binding(&config.binding)
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.exchange_declare(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            self.channel.queue_declare(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} - exchange: {} - key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}
