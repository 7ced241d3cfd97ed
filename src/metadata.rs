// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Metadata
//!
//! Headers carried next to a message on the wire. The producer normalizes them
//! before sending so every message leaves with a message id, a creation time, a
//! correlation id and its type names. Normalization only fills absent values.

use crate::message::Message;
use chrono::{DateTime, Utc};
use std::collections::{btree_map, BTreeMap};
use uuid::Uuid;

/// Header holding the fully-qualified message type
pub const HEADER_MESSAGE_TYPE: &str = "message-type";
/// Header holding the short message type name
pub const HEADER_MESSAGE_NAME: &str = "message-name";
/// Header holding the payload content type
pub const HEADER_CONTENT_TYPE: &str = "content-type";
/// Header holding the message id
pub const HEADER_MESSAGE_ID: &str = "message-id";
/// Header holding the RFC 3339 creation time
pub const HEADER_CREATED: &str = "created";
/// Header holding the correlation id
pub const HEADER_CORRELATION_ID: &str = "correlation-id";

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// Ordered, string-keyed header map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    headers: BTreeMap<String, HeaderValue>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Sets a header, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Sets a header only when it is absent. Returns true when the value was written.
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<HeaderValue>) -> bool {
        match self.headers.entry(key.to_owned()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value.into());
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.headers.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_str(HEADER_MESSAGE_ID)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get_str(HEADER_CORRELATION_ID)
    }

    pub fn message_name(&self) -> Option<&str> {
        self.get_str(HEADER_MESSAGE_NAME)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.get_str(HEADER_MESSAGE_TYPE)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_str(HEADER_CONTENT_TYPE)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.get_str(HEADER_CREATED)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
    }

    /// Fills the headers every outgoing message must carry.
    ///
    /// Values already present are kept as they are, so normalizing twice is a no-op.
    pub fn normalize(&mut self, message: &dyn Message, content_type: &str) {
        let message_type = message.message_type();

        self.set_if_absent(HEADER_MESSAGE_TYPE, message_type.full_name());
        self.set_if_absent(HEADER_MESSAGE_NAME, message_type.name());
        self.set_if_absent(HEADER_CONTENT_TYPE, content_type);
        self.set_if_absent(HEADER_MESSAGE_ID, message.message_id());
        self.set_if_absent(HEADER_CREATED, message.created().to_rfc3339());
        if !self.contains_key(HEADER_CORRELATION_ID) {
            self.set(HEADER_CORRELATION_ID, Uuid::new_v4().to_string());
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata {
            headers: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Metadata {
    type Item = (String, HeaderValue);
    type IntoIter = btree_map::IntoIter<String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.into_iter()
    }
}
