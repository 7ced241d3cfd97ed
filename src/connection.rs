// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single broker connection shared by the producer and every consumer.
//!
//! A supervisor task waits for the connection to be lost. When that happens the
//! manager marks itself disconnected, forwards the cause to every
//! [`ConnectionManager::notify_close`] listener and, when auto reconnect is
//! enabled, redials after a fixed delay until the broker answers again. Each
//! successful redial is announced once on the [`ConnectionManager::reconnected`]
//! stream, which is what consumers use to resubscribe.
//!
//! Only the first dial reports its error to the caller; later failures are
//! logged and retried without limit.

use crate::{
    config::RabbitMQOptions,
    errors::AmqpError,
    shutdown::{shutdown_channel, Shutdown, ShutdownTrigger},
    transport::{BrokerChannel, BrokerConnection, Transport},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const RECONNECT_SIGNAL_CAPACITY: usize = 16;

/// Shared, self-healing broker connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    reconnected: broadcast::Sender<()>,
    close_listeners: Mutex<Vec<mpsc::UnboundedSender<AmqpError>>>,
    close_trigger: ShutdownTrigger,
}

impl ConnectionManager {
    /// Dials the broker and starts supervising the connection.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: &RabbitMQOptions,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        debug!(host = options.host, port = options.port, "connecting to rabbitmq...");

        let connection = transport.dial().await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect to rabbitmq");
            match err {
                AmqpError::ConnectionError(_) => err,
                other => AmqpError::ConnectionError(other.to_string()),
            }
        })?;

        let (close_trigger, shutdown) = shutdown_channel();
        let (reconnected, _) = broadcast::channel(RECONNECT_SIGNAL_CAPACITY);

        let manager = Arc::new(ConnectionManager {
            transport,
            auto_reconnect: options.auto_reconnect,
            reconnect_delay: options.reconnect_delay(),
            connection: RwLock::new(Some(connection.clone())),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            reconnected,
            close_listeners: Mutex::new(vec![]),
            close_trigger,
        });

        tokio::spawn(supervise(Arc::downgrade(&manager), connection, shutdown));

        debug!("rabbitmq connected");
        Ok(manager)
    }

    /// Opens a new channel on the current connection.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() || !self.is_connected() {
            return Err(AmqpError::Disconnected);
        }

        let connection = self
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AmqpError::Disconnected)?;

        connection.create_channel().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether [`ConnectionManager::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers a listener for unexpected connection losses.
    pub fn notify_close(&self, listener: mpsc::UnboundedSender<AmqpError>) {
        self.close_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Subscribes to reconnect signals. One `()` is sent per successful redial.
    pub fn reconnected(&self) -> broadcast::Receiver<()> {
        self.reconnected.subscribe()
    }

    /// Closes the connection for good. No reconnect follows.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.close_trigger.trigger();
        self.connected.store(false, Ordering::SeqCst);

        let connection = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match connection {
            Some(connection) => {
                debug!("closing rabbitmq connection...");
                connection.close().await
            }
            None => Ok(()),
        }
    }

    fn connection_lost(&self, cause: &AmqpError) {
        self.connected.store(false, Ordering::SeqCst);

        self.close_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|listener| listener.send(cause.clone()).is_ok());
    }

    fn replace_connection(&self, connection: Arc<dyn BrokerConnection>) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        self.connected.store(true, Ordering::SeqCst);
    }
}

async fn supervise(
    manager: Weak<ConnectionManager>,
    mut connection: Arc<dyn BrokerConnection>,
    mut shutdown: Shutdown,
) {
    loop {
        let cause = tokio::select! {
            _ = shutdown.triggered() => return,
            cause = connection.closed() => cause,
        };

        let Some(this) = manager.upgrade() else {
            return;
        };
        if this.is_closed() {
            return;
        }

        error!(error = cause.to_string(), "rabbitmq connection lost");
        this.connection_lost(&cause);

        if !this.auto_reconnect {
            warn!("auto reconnect disabled, rabbitmq connection stays down");
            return;
        }

        let transport = this.transport.clone();
        let delay = this.reconnect_delay;
        drop(this);

        connection = match redial(&manager, transport.as_ref(), delay, &mut shutdown).await {
            Some(connection) => connection,
            None => return,
        };
    }
}

/// Dials until it succeeds. Returns `None` when the manager closed or went away.
async fn redial(
    manager: &Weak<ConnectionManager>,
    transport: &dyn Transport,
    delay: Duration,
    shutdown: &mut Shutdown,
) -> Option<Arc<dyn BrokerConnection>> {
    let mut attempt: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        debug!(attempt, "reconnecting to rabbitmq...");

        match transport.dial().await {
            Ok(connection) => {
                let this = manager.upgrade()?;
                if this.is_closed() {
                    if let Err(err) = connection.close().await {
                        warn!(error = err.to_string(), "failure to close redialed connection");
                    }
                    return None;
                }

                this.replace_connection(connection.clone());
                info!(attempt, "rabbitmq reconnected");
                let _ = this.reconnected.send(());

                return Some(connection);
            }
            Err(err) => {
                error!(attempt, error = err.to_string(), "failure to reconnect to rabbitmq");
            }
        }
    }
}
