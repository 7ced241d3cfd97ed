// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Exchange, queue, binding and runtime settings of one consumer. Every name left
//! empty is derived from the snake-cased message type name when the configuration
//! is built, so independently deployed instances agree on the topology.

use crate::{
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, ConsumerPipeline},
    message::{Message, MessageType},
    metadata::HeaderValue,
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
};
use std::{fmt, sync::Arc};
use uuid::Uuid;

/// Default number of deliveries prefetched per worker
pub const DEFAULT_PREFETCH_COUNT: u16 = 4;
/// Default number of concurrently handled deliveries
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 1;

/// Immutable consumer configuration, see [`ConsumerConfigurationBuilder`].
#[derive(Clone)]
pub struct ConsumerConfiguration {
    pub(crate) message_type: MessageType,
    pub(crate) name: String,
    pub(crate) consumer_id: String,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
    pub(crate) prefetch_count: u16,
    pub(crate) concurrency_limit: usize,
    pub(crate) exit_on_error: bool,
    pub(crate) auto_ack: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) handlers: Vec<Arc<dyn ConsumerHandler>>,
    pub(crate) pipelines: Vec<Arc<dyn ConsumerPipeline>>,
}

impl ConsumerConfiguration {
    /// Configuration with every default for `T`.
    pub fn for_message<T: Message>() -> ConsumerConfiguration {
        ConsumerConfigurationBuilder::for_message::<T>().build()
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// QoS prefetch of the channel: every worker keeps `prefetch_count` buffered.
    pub fn channel_prefetch(&self) -> u16 {
        let total = self.concurrency_limit.saturating_mul(self.prefetch_count as usize);
        total.min(u16::MAX as usize) as u16
    }

    pub fn exit_on_error(&self) -> bool {
        self.exit_on_error
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn handlers(&self) -> &[Arc<dyn ConsumerHandler>] {
        &self.handlers
    }

    pub fn pipelines(&self) -> &[Arc<dyn ConsumerPipeline>] {
        &self.pipelines
    }
}

impl fmt::Debug for ConsumerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfiguration")
            .field("message_type", &self.message_type)
            .field("name", &self.name)
            .field("consumer_id", &self.consumer_id)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("binding", &self.binding)
            .field("prefetch_count", &self.prefetch_count)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("exit_on_error", &self.exit_on_error)
            .field("auto_ack", &self.auto_ack)
            .field("handlers", &self.handlers.len())
            .field("pipelines", &self.pipelines.len())
            .finish_non_exhaustive()
    }
}

/// Fluent builder of [`ConsumerConfiguration`].
pub struct ConsumerConfigurationBuilder {
    config: ConsumerConfiguration,
}

impl ConsumerConfigurationBuilder {
    pub fn new(message_type: MessageType) -> ConsumerConfigurationBuilder {
        ConsumerConfigurationBuilder {
            config: ConsumerConfiguration {
                message_type,
                name: String::new(),
                consumer_id: Uuid::new_v4().to_string(),
                exchange: ExchangeDefinition::new(""),
                queue: QueueDefinition::new(""),
                binding: QueueBinding::default(),
                prefetch_count: DEFAULT_PREFETCH_COUNT,
                concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
                exit_on_error: false,
                auto_ack: false,
                no_local: false,
                no_wait: false,
                retry: RetryPolicy::default(),
                handlers: vec![],
                pipelines: vec![],
            },
        }
    }

    pub fn for_message<T: Message>() -> ConsumerConfigurationBuilder {
        ConsumerConfigurationBuilder::new(MessageType::of::<T>())
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_owned();
        self
    }

    /// Consumer tag sent to the broker.
    pub fn consumer_id(mut self, consumer_id: &str) -> Self {
        self.config.consumer_id = consumer_id.to_owned();
        self
    }

    pub fn exchange_name(mut self, name: &str) -> Self {
        self.config.exchange = self.config.exchange.rename(name);
        self
    }

    /// Adjusts the exchange definition (kind, durability, arguments...).
    pub fn exchange<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(ExchangeDefinition) -> ExchangeDefinition,
    {
        self.config.exchange = configure(self.config.exchange);
        self
    }

    pub fn queue_name(mut self, name: &str) -> Self {
        self.config.queue = self.config.queue.rename(name);
        self
    }

    /// Adjusts the queue definition (durability, exclusivity, limits...).
    pub fn queue<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(QueueDefinition) -> QueueDefinition,
    {
        self.config.queue = configure(self.config.queue);
        self
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.config.binding = self.config.binding.routing_key(routing_key);
        self
    }

    pub fn binding_param(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.config.binding = self.config.binding.param(key, value);
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.config.prefetch_count = prefetch_count;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    /// Stop consuming once a delivery exhausts its retries.
    pub fn exit_on_error(mut self, exit_on_error: bool) -> Self {
        self.config.exit_on_error = exit_on_error;
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.config.auto_ack = auto_ack;
        self
    }

    pub fn no_local(mut self, no_local: bool) -> Self {
        self.config.no_local = no_local;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.config.no_wait = no_wait;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.config.handlers.push(handler);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<dyn ConsumerPipeline>) -> Self {
        self.config.pipelines.push(pipeline);
        self
    }

    pub fn build(self) -> ConsumerConfiguration {
        let mut config = self.config;
        let derived = config.message_type.snake_name();

        if config.name.is_empty() {
            config.name = derived.clone();
        }
        if config.consumer_id.is_empty() {
            config.consumer_id = Uuid::new_v4().to_string();
        }
        if config.exchange.name.is_empty() {
            config.exchange = config.exchange.rename(&derived);
        }
        if config.queue.name.is_empty() {
            config.queue = config.queue.rename(&derived);
        }

        let routing_key = if config.binding.routing_key.is_empty() {
            derived
        } else {
            config.binding.routing_key.clone()
        };
        config.binding = config
            .binding
            .exchange(&config.exchange.name)
            .routing_key(&routing_key);
        config.binding.queue_name = config.queue.name.clone();

        config.concurrency_limit = config.concurrency_limit.max(1);
        config.prefetch_count = config.prefetch_count.max(1);

        config
    }
}
