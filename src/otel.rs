// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Producer and consumer spans for every published and consumed message. Trace
//! context travels inside the message [`Metadata`], injected by the producer and
//! extracted by the consumer through the globally configured text-map propagator.

use crate::{errors::AmqpError, metadata::Metadata};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::borrow::Cow;

/// Name of the tracer used for bus spans
pub const TRACER_NAME: &str = "rabbitmq-bus";

const MESSAGING_SYSTEM: &str = "rabbitmq";

/// Attributes describing the message a span is about.
#[derive(Debug, Clone, Copy)]
pub struct SpanAttributes<'a> {
    pub message_name: &'a str,
    pub message_id: &'a str,
    pub correlation_id: &'a str,
    /// Exchange for producer spans, queue for consumer spans
    pub destination: &'a str,
    pub payload: &'a [u8],
}

/// A started span that is closed exactly once.
pub trait MessageSpan: Send {
    fn finish(self: Box<Self>, error: Option<&AmqpError>);
}

/// Starts messaging spans.
pub trait MessageTracer: Send + Sync {
    /// Starts a producer span and writes its trace context into `metadata`.
    fn start_producer_span(
        &self,
        attributes: &SpanAttributes<'_>,
        metadata: &mut Metadata,
    ) -> Box<dyn MessageSpan>;

    /// Starts a consumer span whose parent is read from `metadata`.
    fn start_consumer_span(
        &self,
        attributes: &SpanAttributes<'_>,
        metadata: &Metadata,
    ) -> Box<dyn MessageSpan>;
}

/// Injects trace context into message metadata.
pub(crate) struct MetadataInjector<'a> {
    metadata: &'a mut Metadata,
}

impl<'a> MetadataInjector<'a> {
    pub(crate) fn new(metadata: &'a mut Metadata) -> Self {
        Self { metadata }
    }
}

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.metadata.set(key.to_lowercase(), value);
    }
}

/// Extracts trace context from message metadata.
pub(crate) struct MetadataExtractor<'a> {
    metadata: &'a Metadata,
}

impl<'a> MetadataExtractor<'a> {
    pub(crate) fn new(metadata: &'a Metadata) -> Self {
        Self { metadata }
    }
}

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.metadata.iter().map(|(key, _)| key.as_str()).collect()
    }
}

/// [`MessageTracer`] backed by the global OpenTelemetry tracer provider.
///
/// With no provider installed every span is a no-op.
pub struct OtelMessageTracer {
    tracer: BoxedTracer,
}

impl Default for OtelMessageTracer {
    fn default() -> Self {
        OtelMessageTracer {
            tracer: global::tracer(TRACER_NAME),
        }
    }
}

impl OtelMessageTracer {
    pub fn new() -> OtelMessageTracer {
        OtelMessageTracer::default()
    }

    fn attributes(attributes: &SpanAttributes<'_>, metadata: &Metadata) -> Vec<KeyValue> {
        let mut values = vec![
            KeyValue::new("messaging.system", MESSAGING_SYSTEM),
            KeyValue::new(
                "messaging.destination.name",
                attributes.destination.to_owned(),
            ),
            KeyValue::new("messaging.message.id", attributes.message_id.to_owned()),
            KeyValue::new(
                "messaging.message.conversation_id",
                attributes.correlation_id.to_owned(),
            ),
            KeyValue::new("messaging.message.type", attributes.message_name.to_owned()),
            KeyValue::new(
                "messaging.message.body.size",
                attributes.payload.len() as i64,
            ),
            KeyValue::new(
                "messaging.message.payload",
                String::from_utf8_lossy(attributes.payload).into_owned(),
            ),
        ];

        for (key, value) in metadata.iter() {
            if let Some(value) = value.as_str() {
                values.push(KeyValue::new(
                    format!("messaging.header.{}", key),
                    value.to_owned(),
                ));
            }
        }

        values
    }
}

impl MessageTracer for OtelMessageTracer {
    fn start_producer_span(
        &self,
        attributes: &SpanAttributes<'_>,
        metadata: &mut Metadata,
    ) -> Box<dyn MessageSpan> {
        let span = self
            .tracer
            .span_builder(Cow::from(format!("{} send", attributes.message_name)))
            .with_kind(SpanKind::Producer)
            .with_attributes(Self::attributes(attributes, metadata))
            .start_with_context(&self.tracer, &Context::current());

        let ctx = Context::current().with_remote_span_context(span.span_context().clone());
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&ctx, &mut MetadataInjector::new(metadata))
        });

        Box::new(OtelMessageSpan { span })
    }

    fn start_consumer_span(
        &self,
        attributes: &SpanAttributes<'_>,
        metadata: &Metadata,
    ) -> Box<dyn MessageSpan> {
        let parent = global::get_text_map_propagator(|propagator| {
            propagator.extract(&MetadataExtractor::new(metadata))
        });

        let span = self
            .tracer
            .span_builder(Cow::from(format!("{} process", attributes.message_name)))
            .with_kind(SpanKind::Consumer)
            .with_attributes(Self::attributes(attributes, metadata))
            .start_with_context(&self.tracer, &parent);

        Box::new(OtelMessageSpan { span })
    }
}

struct OtelMessageSpan {
    span: BoxedSpan,
}

impl MessageSpan for OtelMessageSpan {
    fn finish(mut self: Box<Self>, error: Option<&AmqpError>) {
        match error {
            Some(err) => {
                self.span.record_error(err);
                self.span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            None => self.span.set_status(Status::Ok),
        }
        self.span.end();
    }
}
