// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Options
//!
//! Plain options struct describing how to reach the broker and how the bus should
//! behave when the connection drops. Loading it from the environment or from
//! files is left to the application.

use serde::Deserialize;
use std::time::Duration;

/// Broker connection and bus runtime options.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQOptions {
    /// Name reported to the broker as the connection name
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Start every registered consumer as soon as the bus is built
    pub auto_start: bool,
    /// Redial the broker after an unexpected connection loss
    pub auto_reconnect: bool,
    /// Pause between two redial attempts, in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for RabbitMQOptions {
    fn default() -> Self {
        RabbitMQOptions {
            app_name: "rabbitmq-bus".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            auto_start: false,
            auto_reconnect: true,
            reconnect_delay_ms: 2_000,
        }
    }
}

impl RabbitMQOptions {
    /// Builds the AMQP URI used to dial the broker.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
