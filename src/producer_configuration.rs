// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Configuration
//!
//! Where and how a message type is published. Unconfigured message types get the
//! same snake-cased defaults consumers derive, so a producer and a consumer of the
//! same type meet on the same exchange and routing key.

use crate::{
    exchange::ExchangeDefinition,
    message::{Message, MessageType},
    transport::DeliveryMode,
};

/// Immutable producer configuration, see [`ProducerConfigurationBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfiguration {
    pub(crate) message_type: MessageType,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) priority: Option<u8>,
    pub(crate) app_id: Option<String>,
    pub(crate) expiration: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) content_encoding: Option<String>,
}

impl ProducerConfiguration {
    /// Configuration with every default for the given type.
    pub fn for_type(message_type: MessageType) -> ProducerConfiguration {
        ProducerConfigurationBuilder::new(message_type).build()
    }

    pub fn for_message<T: Message>() -> ProducerConfiguration {
        ProducerConfiguration::for_type(MessageType::of::<T>())
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }
}

/// Fluent builder of [`ProducerConfiguration`].
#[derive(Debug, Clone)]
pub struct ProducerConfigurationBuilder {
    config: ProducerConfiguration,
}

impl ProducerConfigurationBuilder {
    pub fn new(message_type: MessageType) -> ProducerConfigurationBuilder {
        ProducerConfigurationBuilder {
            config: ProducerConfiguration {
                message_type,
                exchange: ExchangeDefinition::new(""),
                routing_key: String::new(),
                delivery_mode: DeliveryMode::Persistent,
                priority: None,
                app_id: None,
                expiration: None,
                reply_to: None,
                content_encoding: None,
            },
        }
    }

    pub fn for_message<T: Message>() -> ProducerConfigurationBuilder {
        ProducerConfigurationBuilder::new(MessageType::of::<T>())
    }

    pub fn exchange_name(mut self, name: &str) -> Self {
        self.config.exchange = self.config.exchange.rename(name);
        self
    }

    pub fn exchange<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(ExchangeDefinition) -> ExchangeDefinition,
    {
        self.config.exchange = configure(self.config.exchange);
        self
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.config.routing_key = routing_key.to_owned();
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.config.delivery_mode = mode;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.config.priority = Some(priority);
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.config.app_id = Some(app_id.to_owned());
        self
    }

    /// Per-message TTL, in milliseconds as the broker expects it.
    pub fn expiration(mut self, expiration: &str) -> Self {
        self.config.expiration = Some(expiration.to_owned());
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.config.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn content_encoding(mut self, encoding: &str) -> Self {
        self.config.content_encoding = Some(encoding.to_owned());
        self
    }

    pub fn build(self) -> ProducerConfiguration {
        let mut config = self.config;
        let derived = config.message_type.snake_name();

        if config.exchange.name.is_empty() {
            config.exchange = config.exchange.rename(&derived);
        }
        if config.routing_key.is_empty() {
            config.routing_key = derived;
        }

        config
    }
}
