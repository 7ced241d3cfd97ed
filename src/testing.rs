// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Implements the transport traits with direct, fanout and topic routing,
//! round-robin dispatch between the consumers of a queue, manual
//! acknowledgements with requeue, and a way to drop every open connection the
//! way a broker restart would.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::Message,
    metadata::Metadata,
    otel::{MessageSpan, MessageTracer, SpanAttributes},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryAcker, DeliveryStream,
        InboundDelivery, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProductCreatedV1 {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl ProductCreatedV1 {
    pub fn new(product_id: &str, name: &str, price: f64) -> ProductCreatedV1 {
        ProductCreatedV1 {
            id: uuid::Uuid::new_v4().to_string(),
            product_id: product_id.to_owned(),
            name: name.to_owned(),
            price,
            created_at: Utc::now(),
        }
    }
}

impl Message for ProductCreatedV1 {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Tracer keeping the outcome of every finished span, producer and consumer
/// alike. Producer spans add a fixed `traceparent` header.
#[derive(Default)]
pub(crate) struct RecordingTracer {
    pub finished: Arc<Mutex<Vec<Option<String>>>>,
}

struct RecordingSpan {
    finished: Arc<Mutex<Vec<Option<String>>>>,
}

impl MessageSpan for RecordingSpan {
    fn finish(self: Box<Self>, error: Option<&AmqpError>) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.map(|err| err.to_string()));
    }
}

impl MessageTracer for RecordingTracer {
    fn start_producer_span(
        &self,
        _attributes: &SpanAttributes<'_>,
        metadata: &mut Metadata,
    ) -> Box<dyn MessageSpan> {
        metadata.set("traceparent", "00-trace-span-01");
        Box::new(RecordingSpan {
            finished: self.finished.clone(),
        })
    }

    fn start_consumer_span(
        &self,
        _attributes: &SpanAttributes<'_>,
        _metadata: &Metadata,
    ) -> Box<dyn MessageSpan> {
        Box::new(RecordingSpan {
            finished: self.finished.clone(),
        })
    }
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
    redelivered: bool,
}

struct ConsumerEntry {
    channel_id: u64,
    tag: String,
    auto_ack: bool,
    acker: Arc<dyn DeliveryAcker>,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, Unacked>,
    connections: Vec<Arc<MemoryConnection>>,
    published: Vec<OutboundMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    queue_declarations: HashMap<String, usize>,
    qos: Vec<u16>,
    next_delivery_tag: u64,
    dials: usize,
    unavailable: bool,
    nack_confirms: bool,
    failing_settlements: bool,
    channels_opened: usize,
    channels_closed: usize,
    failing_channels: usize,
}

impl BrokerState {
    fn deliver(&mut self, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        loop {
            if queue.consumers.is_empty() {
                queue.ready.push_back(message);
                return;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = idx + 1;
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;

            let consumer = &queue.consumers[idx];
            let (channel_id, auto_ack) = (consumer.channel_id, consumer.auto_ack);
            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                content_type: Some(message.message.content_type.clone())
                    .filter(|content_type| !content_type.is_empty()),
                kind: Some(message.message.kind.clone()).filter(|kind| !kind.is_empty()),
                message_id: message.message.message_id.clone(),
                correlation_id: message.message.correlation_id.clone(),
                timestamp: Some(message.message.timestamp),
                headers: message.message.headers.clone(),
                body: message.message.body.clone(),
                acker: consumer.acker.clone(),
            };

            if consumer.tx.send(Ok(delivery)).is_err() {
                queue.consumers.remove(idx);
                continue;
            }

            if !auto_ack {
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        channel_id,
                        message,
                    },
                );
            }
            return;
        }
    }

    fn requeue(&mut self, mut tags: Vec<u64>) {
        tags.sort_unstable();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.deliver(&unacked.queue, message);
            }
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_owned()];
        }

        let kind = self.exchanges.get(exchange);
        let mut queues: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match kind {
                Some(ExchangeKind::Fanout) | Some(ExchangeKind::Headers) => true,
                Some(ExchangeKind::Topic) => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };
            if matched && !queues.contains(&binding.queue_name) {
                queues.push(binding.queue_name.clone());
            }
        }
        queues
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && words_match(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && words_match(rest, &words[1..]),
    }
}

/// A broker living in the test process. Also the [`Transport`] dialing it.
pub(crate) struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_channel_id: AtomicU64,
    this: Weak<MemoryBroker>,
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new_cyclic(|this| MemoryBroker {
            state: Mutex::new(BrokerState::default()),
            next_channel_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes every open connection with an error, ending all consumer streams
    /// and requeueing unacknowledged deliveries.
    pub fn drop_connections(&self) {
        let connections = {
            let mut state = self.lock();
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
            }
            let tags: Vec<u64> = state.unacked.keys().copied().collect();
            state.requeue(tags);
            std::mem::take(&mut state.connections)
        };

        for connection in connections {
            connection.connected.store(false, Ordering::SeqCst);
            connection.closed_tx.send_replace(Some(AmqpError::ConnectionError(
                "connection reset by broker".to_owned(),
            )));
        }
    }

    /// Drops every consumer of `queue` while the connection stays up, the way a
    /// broker-side cancel does. Their delivery streams end.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(queue) = self.lock().queues.get_mut(queue) {
            queue.consumers.clear();
        }
    }

    /// Makes the next `count` channel creations fail.
    pub fn fail_next_channels(&self, count: usize) {
        self.lock().failing_channels = count;
    }

    /// Makes subsequent dials fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Makes the broker nack publisher confirms until called again with `false`.
    pub fn set_nack_confirms(&self, nack: bool) {
        self.lock().nack_confirms = nack;
    }

    /// Makes acks and nacks fail at the transport until called again with `false`.
    pub fn set_failing_settlements(&self, failing: bool) {
        self.lock().failing_settlements = failing;
    }

    /// Channels created and not closed yet.
    pub fn open_channels(&self) -> usize {
        let state = self.lock();
        state.channels_opened - state.channels_closed
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.lock().nacks.clone()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_declarations(&self, name: &str) -> usize {
        self.lock().queue_declarations.get(name).copied().unwrap_or(0)
    }

    pub fn is_bound(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.lock().bindings.iter().any(|b| {
            b.exchange_name == exchange && b.queue_name == queue && b.routing_key == routing_key
        })
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn qos(&self) -> Vec<u16> {
        self.lock().qos.clone()
    }

    fn handle(&self) -> Result<Arc<MemoryBroker>, AmqpError> {
        self.this
            .upgrade()
            .ok_or_else(|| AmqpError::ConnectionError("broker is gone".to_owned()))
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let broker = self.handle()?;
        let mut state = self.lock();
        state.dials += 1;
        if state.unavailable {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let (closed_tx, _) = watch::channel(None);
        let connection = Arc::new(MemoryConnection {
            broker,
            connected: Arc::new(AtomicBool::new(true)),
            closed_tx,
        });
        state.connections.push(connection.clone());

        Ok(connection)
    }
}

pub(crate) struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    connected: Arc<AtomicBool>,
    closed_tx: watch::Sender<Option<AmqpError>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        {
            let mut state = self.broker.lock();
            if state.failing_channels > 0 {
                state.failing_channels -= 1;
                return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
            }
            state.channels_opened += 1;
        }
        Ok(Arc::new(MemoryChannel {
            id: self.broker.next_channel_id.fetch_add(1, Ordering::SeqCst),
            broker: self.broker.clone(),
            connected: self.connected.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn closed(&self) -> AmqpError {
        let mut rx = self.closed_tx.subscribe();
        let cause = match rx.wait_for(Option::is_some).await {
            Ok(err) => err.clone().unwrap_or(AmqpError::Disconnected),
            Err(_) => AmqpError::Disconnected,
        };
        cause
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MemoryChannel {
    id: u64,
    broker: Arc<MemoryBroker>,
    connected: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if !self.connected.load(Ordering::SeqCst) || !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&exchange.name) {
            Some(kind) if kind != &exchange.kind => Err(AmqpError::DeclareExchangeError(format!(
                "inequivalent arg 'type' for exchange '{}'",
                exchange.name
            ))),
            _ => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.kind.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.queues.entry(queue.name.clone()).or_default();
        *state
            .queue_declarations
            .entry(queue.name.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.lock().qos.push(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let acker: Arc<dyn DeliveryAcker> = Arc::new(MemoryAcker {
            broker: self.broker.clone(),
            open: self.open.clone(),
        });

        let mut state = self.broker.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(format!(
                "no queue '{queue}' in vhost '/'"
            )));
        };
        queue_state.consumers.push(ConsumerEntry {
            channel_id: self.id,
            tag: consumer_tag.to_owned(),
            auto_ack: options.auto_ack,
            acker,
            tx,
        });
        let ready: Vec<StoredMessage> = queue_state.ready.drain(..).collect();
        for message in ready {
            state.deliver(queue, message);
        }

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!(
                "no exchange '{exchange}' in vhost '/'"
            )));
        }
        if state.nack_confirms {
            return Err(AmqpError::PublishNotConfirmed);
        }

        state.published.push(message.clone());
        for queue in state.routes(exchange, routing_key) {
            state.deliver(
                &queue,
                StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    message: message.clone(),
                    redelivered: false,
                },
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.lock();
        state.channels_closed += 1;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != self.id);
        }
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        state.requeue(tags);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<MemoryBroker>,
    open: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, delivery_tag: u64) -> Result<(), String> {
        if !self.open.load(Ordering::SeqCst) {
            return Err("channel is closed".to_owned());
        }
        let state = self.broker.lock();
        if state.failing_settlements {
            return Err(format!("channel error while settling {delivery_tag}"));
        }
        match state.unacked.contains_key(&delivery_tag) {
            true => Ok(()),
            false => Err(format!("unknown delivery tag {delivery_tag}")),
        }
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag).map_err(AmqpError::AckMessageError)?;
        let mut state = self.broker.lock();
        state.unacked.remove(&delivery_tag);
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settle(delivery_tag).map_err(AmqpError::NackMessageError)?;
        let mut state = self.broker.lock();
        state.nacks.push((delivery_tag, requeue));
        match requeue {
            true => state.requeue(vec![delivery_tag]),
            false => {
                state.unacked.remove(&delivery_tag);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("product_created_v1", "product_created_v1"));
        assert!(!topic_matches("product_created_v1", "product_deleted_v1"));
    }

    #[tokio::test]
    async fn routes_to_bound_queues_and_requeues_nacks() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        channel
            .exchange_declare(&ExchangeDefinition::new("catalog").direct())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("products"))
            .await
            .unwrap();
        channel
            .queue_bind(
                &QueueBinding::new("products")
                    .exchange("catalog")
                    .routing_key("created"),
            )
            .await
            .unwrap();

        let message = OutboundMessage {
            body: b"{}".to_vec(),
            ..Default::default()
        };
        channel
            .basic_publish("catalog", "created", true, message.clone())
            .await
            .unwrap();
        channel
            .basic_publish("catalog", "deleted", true, message)
            .await
            .unwrap();
        assert_eq!(broker.ready_count("products"), 1);

        let mut stream = channel
            .basic_consume("products", "c-1", ConsumeOptions::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();

        assert_eq!(broker.nacks(), vec![(first.delivery_tag, true)]);
        assert_eq!(broker.acks(), vec![second.delivery_tag]);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn dropping_connections_ends_streams() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .queue_declare(&QueueDefinition::new("q"))
            .await
            .unwrap();
        let mut stream = channel
            .basic_consume("q", "c", ConsumeOptions::default())
            .await
            .unwrap();

        broker.drop_connections();

        assert!(stream.next().await.is_none());
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.closed().await,
            AmqpError::ConnectionError(_)
        ));
        assert!(connection.create_channel().await.is_err());
    }
}
