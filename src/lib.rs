// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod retry;

pub mod bus;
pub mod bus_configuration;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod consumer_configuration;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod metadata;
pub mod observer;
pub mod producer;
pub mod producer_configuration;
pub mod queue;
pub mod serializer;
pub mod shutdown;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bus::RabbitMQBus;
pub use bus_configuration::{RabbitMQBusConfiguration, RabbitMQBusConfigurationBuilder};
pub use config::RabbitMQOptions;
pub use errors::AmqpError;
pub use handler::{handler_fn, ConsumeContext, ConsumerHandler, ConsumerPipeline, Next};
pub use message::{Message, MessageType};
pub use metadata::Metadata;
pub use otel::{MessageSpan, MessageTracer, OtelMessageTracer, SpanAttributes};
pub use retry::RetryPolicy;
pub use serializer::{JsonMessageSerializer, MessageSerializer};
