// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declarations and queue-to-exchange bindings. Optional TTL and length
//! limits are translated into the matching `x-` queue arguments on declaration.

use crate::metadata::HeaderValue;
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_ARGS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) params: BTreeMap<String, HeaderValue>,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub(crate) fn rename(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Sets whether the queue survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the queue is deleted when its last consumer goes away.
    pub fn auto_delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message TTL for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a single argument to the queue.
    pub fn param(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    /// Arguments sent with the declaration, limits included.
    pub fn arguments(&self) -> BTreeMap<String, HeaderValue> {
        let mut args = self.params.clone();

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_ARGS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl.into()));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_ARGS_MAX_LENGTH.to_owned(), HeaderValue::Int(max.into()));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                AMQP_ARGS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::Int(max_bytes.into()),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) params: BTreeMap<String, HeaderValue>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn routing_key_ref(&self) -> &str {
        &self.routing_key
    }

    pub fn params_ref(&self) -> &BTreeMap<String, HeaderValue> {
        &self.params
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }
}
