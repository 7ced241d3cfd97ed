// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A consumer owns one queue subscription for one message type. Starting it
//! declares the topology, opens a prefetch-limited channel and spawns
//! `concurrency_limit` workers sharing the delivery stream. Every delivery is
//! handled on its own task while holding one of `concurrency_limit` slots, so no
//! more than that many handlers ever run at once.
//!
//! Handling a delivery runs every handler in registration order, each wrapped by
//! the retry policy and the pipeline chain. The delivery is acked when all of
//! them succeed and nacked with requeue otherwise; consumed observers are told
//! about every attempt either way. Auto-ack deliveries are neither settled nor
//! observed.
//!
//! When the shared connection comes back after an outage the consumer starts
//! again on its own: one watcher per consumer listens for reconnect signals.

use crate::{
    connection::ConnectionManager,
    consumer_configuration::ConsumerConfiguration,
    errors::{AmqpError, HandlerError},
    handler::{ConsumeContext, ConsumerHandler, ConsumerPipeline, Next},
    message::MessageType,
    observer::{ConsumedObserver, ConsumedObservers},
    otel::{MessageTracer, SpanAttributes},
    serializer::MessageSerializer,
    shutdown::{shutdown_channel, Shutdown, ShutdownTrigger},
    topology::{AmqpTopology, Topology},
    transport::{BrokerChannel, ConsumeOptions, DeliveryStream, InboundDelivery},
};
use chrono::{DateTime, Utc};
use futures_util::{stream::Fuse, StreamExt};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex as AsyncMutex, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The connection came back and the consumer is subscribing again
    Reconnecting,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConsumerState::Created => "created",
            ConsumerState::Starting => "starting",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Reconnecting => "reconnecting",
        };
        f.write_str(state)
    }
}

/// One subscription: its channel, its workers and the signal stopping both.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    stop: Arc<ShutdownTrigger>,
    workers: Vec<JoinHandle<()>>,
}

/// Consumes one message type from its queue.
pub struct RabbitMQConsumer {
    config: ConsumerConfiguration,
    connection: Arc<ConnectionManager>,
    serializer: Arc<dyn MessageSerializer>,
    tracer: Arc<dyn MessageTracer>,
    handlers: RwLock<Vec<Arc<dyn ConsumerHandler>>>,
    pipelines: RwLock<Vec<Arc<dyn ConsumerPipeline>>>,
    consumed: ConsumedObservers,
    slots: Arc<Semaphore>,
    state: Mutex<ConsumerState>,
    session: AsyncMutex<Option<Session>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    this: Weak<RabbitMQConsumer>,
}

impl RabbitMQConsumer {
    /// Creates a consumer. Its consumed observers also notify `observers`.
    pub fn new(
        config: ConsumerConfiguration,
        connection: Arc<ConnectionManager>,
        serializer: Arc<dyn MessageSerializer>,
        tracer: Arc<dyn MessageTracer>,
        observers: Arc<ConsumedObservers>,
    ) -> Arc<RabbitMQConsumer> {
        Arc::new_cyclic(|this| RabbitMQConsumer {
            handlers: RwLock::new(config.handlers.clone()),
            pipelines: RwLock::new(config.pipelines.clone()),
            slots: Arc::new(Semaphore::new(permits(&config) as usize)),
            config,
            connection,
            serializer,
            tracer,
            consumed: ConsumedObservers::with_parent(observers),
            state: Mutex::new(ConsumerState::Created),
            session: AsyncMutex::new(None),
            watcher: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.config.message_type
    }

    pub fn configuration(&self) -> &ConsumerConfiguration {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a handler. It sees every delivery handled from now on.
    pub fn connect_handler(&self, handler: Arc<dyn ConsumerHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Appends a pipeline, innermost so far.
    pub fn connect_pipeline(&self, pipeline: Arc<dyn ConsumerPipeline>) {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pipeline);
    }

    /// Registers an observer called after every consumption attempt.
    pub fn is_consumed(&self, observer: Arc<ConsumedObserver>) {
        self.consumed.register(observer);
    }

    /// Declares the topology and starts consuming.
    ///
    /// Calling it again restarts the subscription on a fresh channel. `shutdown`
    /// stops the workers, interrupts retries and ends the reconnect watcher.
    pub async fn start(&self, shutdown: Shutdown) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        self.watch_reconnects(&shutdown);
        self.open(&mut session, shutdown).await
    }

    /// Stops consuming and waits until every in-flight delivery was settled.
    ///
    /// There is no timeout: a handler that never returns blocks this call.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            self.set_state(ConsumerState::Stopped);
            return Ok(());
        };

        self.set_state(ConsumerState::Stopping);
        debug!(consumer = self.config.name.as_str(), "stopping consumer...");

        if let Err(err) = current.channel.basic_cancel(&self.config.consumer_id).await {
            warn!(
                error = err.to_string(),
                consumer = self.config.name.as_str(),
                "failure to cancel the consumer"
            );
        }

        current.stop.trigger();
        for worker in current.workers {
            if let Err(err) = worker.await {
                error!(error = err.to_string(), "consumer worker panicked");
            }
        }

        // every slot back means no handler is running anymore
        match self.slots.acquire_many(permits(&self.config)).await {
            Ok(all) => drop(all),
            Err(err) => error!(error = err.to_string(), "failure to drain consumer"),
        }

        if let Err(err) = current.channel.close().await {
            warn!(
                error = err.to_string(),
                consumer = self.config.name.as_str(),
                "failure to close the consumer channel"
            );
        }

        self.set_state(ConsumerState::Stopped);
        debug!(consumer = self.config.name.as_str(), "consumer stopped");

        Ok(())
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Marks a running subscription whose delivery stream ended as waiting for
    /// the next reconnect. A session already replaced or stopped is left alone.
    fn subscription_lost(&self, stop: &Shutdown) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConsumerState::Running && !stop.is_triggered() {
            *state = ConsumerState::Reconnecting;
        }
    }

    fn handle_ref(&self) -> Result<Arc<RabbitMQConsumer>, AmqpError> {
        self.this
            .upgrade()
            .ok_or_else(|| AmqpError::InternalError("consumer was dropped".to_owned()))
    }

    async fn open(
        &self,
        session: &mut Option<Session>,
        shutdown: Shutdown,
    ) -> Result<(), AmqpError> {
        let this = self.handle_ref()?;
        self.set_state(ConsumerState::Starting);

        if let Some(previous) = session.take() {
            previous.stop.trigger();
            if let Err(err) = previous.channel.close().await {
                debug!(error = err.to_string(), "previous consumer channel already closed");
            }
        }

        let channel = match self.connection.channel().await {
            Ok(channel) => channel,
            Err(err) => {
                self.start_failed(&err);
                return Err(err);
            }
        };

        let deliveries = match self.subscribe(channel.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "failure to close the channel");
                }
                self.start_failed(&err);
                return Err(err);
            }
        };

        let (trigger, stop) = shutdown_channel();
        let trigger = Arc::new(trigger);
        let cancel = shutdown.clone();
        tokio::spawn(forward_shutdown(shutdown, stop.clone(), trigger.clone()));

        let deliveries = Arc::new(AsyncMutex::new(deliveries.fuse()));
        let workers = (0..self.config.concurrency_limit)
            .map(|worker| {
                tokio::spawn(this.clone().work(
                    worker,
                    deliveries.clone(),
                    stop.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        *session = Some(Session {
            channel,
            stop: trigger,
            workers,
        });
        self.set_state(ConsumerState::Running);

        info!(
            consumer = self.config.name.as_str(),
            queue = self.config.queue.name.as_str(),
            workers = self.config.concurrency_limit,
            "consumer started"
        );

        Ok(())
    }

    fn start_failed(&self, err: &AmqpError) {
        error!(
            error = err.to_string(),
            consumer = self.config.name.as_str(),
            "failure to start consumer"
        );
        match err.is_disconnection() {
            true => self.set_state(ConsumerState::Reconnecting),
            false => self.set_state(ConsumerState::Stopped),
        }
    }

    async fn subscribe(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, AmqpError> {
        channel.basic_qos(self.config.channel_prefetch()).await?;

        AmqpTopology::for_consumer(channel, &self.config)
            .install()
            .await?;

        channel
            .basic_consume(
                &self.config.queue.name,
                &self.config.consumer_id,
                ConsumeOptions {
                    auto_ack: self.config.auto_ack,
                    exclusive: false,
                    no_local: self.config.no_local,
                    no_wait: self.config.no_wait,
                },
            )
            .await
    }

    /// Starts the reconnect watcher unless one is already running.
    fn watch_reconnects(&self, shutdown: &Shutdown) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        *watcher = Some(tokio::spawn(resubscribe_on_reconnect(
            self.this.clone(),
            self.connection.reconnected(),
            shutdown.clone(),
        )));
    }

    async fn restart(&self, shutdown: Shutdown) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if matches!(
            self.state(),
            ConsumerState::Stopping | ConsumerState::Stopped
        ) {
            return Ok(());
        }

        self.set_state(ConsumerState::Reconnecting);
        self.open(&mut session, shutdown).await
    }

    /// Pulls deliveries until `stop` fires or the stream ends. `cancel` is the
    /// caller's shutdown and only interrupts retries.
    async fn work(
        self: Arc<Self>,
        worker: usize,
        deliveries: Arc<AsyncMutex<Fuse<DeliveryStream>>>,
        mut stop: Shutdown,
        cancel: Shutdown,
    ) {
        debug!(consumer = self.config.name.as_str(), worker, "worker started");

        loop {
            let next = tokio::select! {
                _ = stop.triggered() => break,
                next = next_delivery(&deliveries) => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), "failure to receive delivery");
                    continue;
                }
                None => {
                    warn!(
                        consumer = self.config.name.as_str(),
                        worker, "delivery stream closed"
                    );
                    self.subscription_lost(&stop);
                    break;
                }
            };

            let slot = tokio::select! {
                _ = stop.triggered() => break,
                slot = self.slots.clone().acquire_owned() => slot,
            };
            let Ok(slot) = slot else {
                break;
            };

            let consumer = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let handled = consumer.handle(delivery, &cancel).await;
                drop(slot);

                if !handled && consumer.config.exit_on_error {
                    error!(
                        consumer = consumer.config.name.as_str(),
                        "handler failure, stopping consumer"
                    );
                    if let Err(err) = consumer.stop().await {
                        error!(error = err.to_string(), "failure to stop consumer");
                    }
                }
            });
        }

        debug!(consumer = self.config.name.as_str(), worker, "worker stopped");
    }

    /// Handles one delivery end to end. Returns whether every handler succeeded.
    async fn handle(&self, delivery: InboundDelivery, cancel: &Shutdown) -> bool {
        let metadata = delivery.headers.clone();
        let message_name = property_or(delivery.kind.as_deref(), metadata.message_name());
        let content_type = property_or(delivery.content_type.as_deref(), metadata.content_type());
        let message_id = property_or(delivery.message_id.as_deref(), metadata.message_id());
        let correlation_id =
            property_or(delivery.correlation_id.as_deref(), metadata.correlation_id());

        debug!(
            "received: {} - exchange: {}",
            message_name, delivery.exchange
        );

        let span = self.tracer.start_consumer_span(
            &SpanAttributes {
                message_name: &message_name,
                message_id: &message_id,
                correlation_id: &correlation_id,
                destination: &self.config.queue.name,
                payload: &delivery.body,
            },
            &metadata,
        );

        let message =
            match self
                .serializer
                .deserialize(&delivery.body, &message_name, &content_type)
            {
                Ok(message) => Some(message),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        message = message_name.as_str(),
                        "failure to deserialize message"
                    );
                    None
                }
            };

        let created = metadata
            .created()
            .or_else(|| message.as_deref().map(|message| message.created()))
            .or_else(|| {
                delivery
                    .timestamp
                    .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            })
            .unwrap_or_else(Utc::now);

        let ctx = ConsumeContext {
            message,
            metadata,
            content_type,
            message_type: message_name,
            created,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            message_id,
            correlation_id,
        };

        let outcome = self.dispatch(&ctx, cancel).await;
        let handling_error = outcome
            .as_ref()
            .err()
            .map(|err| AmqpError::HandlerError(err.to_string()));

        let settled = match (&outcome, self.config.auto_ack) {
            (_, true) => Ok(()),
            (Ok(()), false) => delivery.ack().await,
            (Err(err), false) => {
                warn!(
                    error = err.to_string(),
                    message = ctx.message_type.as_str(),
                    "handler failure, requeuing message"
                );
                delivery.nack(true).await
            }
        };

        if let Err(err) = &settled {
            error!(error = err.to_string(), "failure to settle delivery");
        }

        span.finish(settled.as_ref().err().or(handling_error.as_ref()));
        if !self.config.auto_ack {
            self.consumed.notify(ctx.message());
        }

        outcome.is_ok()
    }

    /// Runs every handler, each through the retry policy and the pipeline chain.
    async fn dispatch(&self, ctx: &ConsumeContext, cancel: &Shutdown) -> Result<(), HandlerError> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let pipelines = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in &handlers {
            let handler = handler.as_ref();
            let pipelines = pipelines.as_slice();

            self.config
                .retry
                .run(cancel, |attempt| async move {
                    debug!(attempt, message = ctx.message_type(), "handling message");
                    Next::new(pipelines, handler).run(ctx).await
                })
                .await?;
        }

        Ok(())
    }
}

impl fmt::Debug for RabbitMQConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMQConsumer")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn permits(config: &ConsumerConfiguration) -> u32 {
    u32::try_from(config.concurrency_limit).unwrap_or(u32::MAX)
}

fn property_or(property: Option<&str>, header: Option<&str>) -> String {
    property
        .filter(|value| !value.is_empty())
        .or(header)
        .unwrap_or_default()
        .to_owned()
}

async fn next_delivery(
    deliveries: &AsyncMutex<Fuse<DeliveryStream>>,
) -> Option<Result<InboundDelivery, AmqpError>> {
    deliveries.lock().await.next().await
}

/// Fires the session trigger when the caller's shutdown fires.
async fn forward_shutdown(mut shutdown: Shutdown, mut stop: Shutdown, trigger: Arc<ShutdownTrigger>) {
    tokio::select! {
        _ = shutdown.triggered() => trigger.trigger(),
        _ = stop.triggered() => {}
    }
}

async fn resubscribe_on_reconnect(
    consumer: Weak<RabbitMQConsumer>,
    mut reconnected: tokio::sync::broadcast::Receiver<()>,
    mut shutdown: Shutdown,
) {
    loop {
        let signal = tokio::select! {
            _ = shutdown.triggered() => return,
            signal = reconnected.recv() => signal,
        };

        match signal {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }

        let Some(consumer) = consumer.upgrade() else {
            return;
        };

        info!(
            consumer = consumer.config.name.as_str(),
            "connection restored, resubscribing"
        );
        if let Err(err) = consumer.restart(shutdown.clone()).await {
            error!(
                error = err.to_string(),
                consumer = consumer.config.name.as_str(),
                "failure to resubscribe, waiting for the next reconnect"
            );
        }
    }
}
