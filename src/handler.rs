// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers and Pipelines
//!
//! A [`ConsumerHandler`] receives the [`ConsumeContext`] built from a delivery.
//! Handlers never see the channel: the consumer acks or nacks the delivery based
//! on the outcome of the whole chain. [`ConsumerPipeline`]s wrap every handler
//! invocation; the first registered pipeline runs outermost and hands control
//! inward by calling [`Next::run`].

use crate::{errors::HandlerError, message::Message, metadata::Metadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{fmt, future::Future, sync::Arc};

/// The normalized, deserialized view of one delivery.
#[derive(Clone)]
pub struct ConsumeContext {
    pub(crate) message: Option<Arc<dyn Message>>,
    pub(crate) metadata: Metadata,
    pub(crate) content_type: String,
    pub(crate) message_type: String,
    pub(crate) created: DateTime<Utc>,
    pub(crate) delivery_tag: u64,
    pub(crate) redelivered: bool,
    pub(crate) message_id: String,
    pub(crate) correlation_id: String,
}

impl ConsumeContext {
    /// The decoded message, or `None` when the payload could not be deserialized.
    pub fn message(&self) -> Option<&dyn Message> {
        self.message.as_deref()
    }

    /// Down-casts the decoded message to its concrete type.
    pub fn message_as<T: Message>(&self) -> Option<&T> {
        self.message().and_then(|message| message.downcast_ref::<T>())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Short type name the message was published with.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("message", &self.message)
            .field("message_type", &self.message_type)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Business logic run for each consumed message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext) -> Result<(), HandlerError>;
}

/// Middleware wrapped around every handler invocation.
#[async_trait]
pub trait ConsumerPipeline: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext, next: Next<'_>) -> Result<(), HandlerError>;
}

/// Continuation handed to a pipeline: the rest of the chain, ending in the handler.
pub struct Next<'a> {
    pipelines: &'a [Arc<dyn ConsumerPipeline>],
    handler: &'a dyn ConsumerHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        pipelines: &'a [Arc<dyn ConsumerPipeline>],
        handler: &'a dyn ConsumerHandler,
    ) -> Next<'a> {
        Next { pipelines, handler }
    }

    /// Runs the remaining pipelines and then the handler.
    pub async fn run(self, ctx: &ConsumeContext) -> Result<(), HandlerError> {
        match self.pipelines.split_first() {
            Some((pipeline, rest)) => pipeline.handle(ctx, Next::new(rest, self.handler)).await,
            None => self.handler.handle(ctx).await,
        }
    }
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure into a [`ConsumerHandler`]. The closure gets its own
/// copy of the context.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &ConsumeContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> ConsumeContext {
    ConsumeContext {
        message: None,
        metadata: Metadata::new(),
        content_type: "application/json".to_owned(),
        message_type: "OrderPlaced".to_owned(),
        created: Utc::now(),
        delivery_tag: 1,
        redelivered: false,
        message_id: "m-1".to_owned(),
        correlation_id: "c-1".to_owned(),
    }
}
