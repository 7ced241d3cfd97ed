// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Observers
//!
//! Callbacks fired after a message was produced or a consumption attempt
//! finished. A registry can have a parent: the bus owns the parent registries and
//! every producer and consumer gets a child, so observers registered on the bus
//! see the notifications of every current and future participant.

use crate::message::Message;
use std::sync::{Arc, PoisonError, RwLock};

/// Called with every successfully published message.
pub type ProducedObserver = dyn Fn(&dyn Message) + Send + Sync;
/// Called after every consumption attempt, acked or nacked. The message is
/// `None` when the payload could not be deserialized.
pub type ConsumedObserver = dyn Fn(Option<&dyn Message>) + Send + Sync;

pub type ProducedObservers = ObserverRegistry<ProducedObserver>;
pub type ConsumedObservers = ObserverRegistry<ConsumedObserver>;

/// Append-only list of observers, optionally chained to a parent registry.
pub struct ObserverRegistry<F: ?Sized> {
    observers: RwLock<Vec<Arc<F>>>,
    parent: Option<Arc<ObserverRegistry<F>>>,
}

impl<F: ?Sized> Default for ObserverRegistry<F> {
    fn default() -> Self {
        ObserverRegistry {
            observers: RwLock::new(vec![]),
            parent: None,
        }
    }
}

impl<F: ?Sized> ObserverRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose notifications also reach `parent`'s observers.
    pub fn with_parent(parent: Arc<ObserverRegistry<F>>) -> Self {
        ObserverRegistry {
            observers: RwLock::new(vec![]),
            parent: Some(parent),
        }
    }

    pub fn register(&self, observer: Arc<F>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Observers to notify, parent ones first.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        let mut all = match &self.parent {
            Some(parent) => parent.snapshot(),
            None => vec![],
        };
        all.extend(
            self.observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        all
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObserverRegistry<ProducedObserver> {
    pub fn notify(&self, message: &dyn Message) {
        for observer in self.snapshot() {
            observer(message);
        }
    }
}

impl ObserverRegistry<ConsumedObserver> {
    pub fn notify(&self, message: Option<&dyn Message>) {
        for observer in self.snapshot() {
            observer(message);
        }
    }
}
