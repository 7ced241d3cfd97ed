// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Message Type Identity
//!
//! Every integration event travelling through the bus implements [`Message`].
//! Messages are keyed by [`MessageType`], an explicit identity token built from the
//! Rust type name. Its snake-cased short name is what exchange, queue and routing
//! key defaults are derived from, so every service instance computes the same
//! topology without coordination.

use chrono::{DateTime, Utc};
use std::{
    any::{type_name, Any},
    fmt,
    hash::{Hash, Hasher},
};

/// Identity token of a message type.
///
/// Two tokens are equal when they were taken from the same Rust type.
#[derive(Clone, Copy)]
pub struct MessageType {
    name: &'static str,
    full_name: &'static str,
}

impl MessageType {
    /// Returns the token of `T`.
    pub fn of<T: ?Sized + 'static>() -> MessageType {
        let full_name = type_name::<T>();
        MessageType {
            name: short_name(full_name),
            full_name,
        }
    }

    /// Short type name, e.g. `ProductCreatedV1`. This is the name carried on the wire.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully-qualified type name.
    pub fn full_name(&self) -> &'static str {
        self.full_name
    }

    /// Snake-cased short name, e.g. `product_created_v1`.
    pub fn snake_name(&self) -> String {
        to_snake_case(self.name)
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_name.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type information every message gets for free.
///
/// Implemented for all `'static` types, so message structs only implement
/// [`Message`] itself. Call these through `&dyn Message`, not through an `Arc`,
/// or the blanket impl of the smart pointer answers instead.
pub trait Typed {
    fn message_type(&self) -> MessageType;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> Typed for T {
    fn message_type(&self) -> MessageType {
        MessageType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A domain event exchanged through the bus.
///
/// Identity is the message id; messages are immutable once built.
pub trait Message: Typed + Send + Sync + fmt::Debug + 'static {
    fn message_id(&self) -> &str;
    fn created(&self) -> DateTime<Utc>;
}

impl dyn Message {
    /// Down-casts the message to its concrete type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Strips module path and generic arguments from a fully-qualified type name.
fn short_name(full_name: &'static str) -> &'static str {
    let base = match full_name.find('<') {
        Some(idx) => &full_name[..idx],
        None => full_name,
    };

    match base.rfind("::") {
        Some(idx) => &base[idx + 2..],
        None => base,
    }
}

/// Converts a PascalCase / camelCase identifier to snake_case.
///
/// Acronyms stay together (`HTTPServer` → `http_server`) and digits stick to the
/// preceding word (`ProductCreatedV1` → `product_created_v1`).
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if *c == '-' || *c == ' ' || *c == '.' {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_uppercase() {
            let prev = if i > 0 { chars.get(i - 1) } else { None };
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }

    out
}
