// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker connectivity.
//!
//! [`BrokerConnection`] owns the single logical connection and drives its handshake. It talks
//! to the broker through the [`AmqpConnector`], [`AmqpSession`] and [`AmqpChannel`] traits,
//! implemented by [`LapinConnector`] for RabbitMQ and by [`MemoryBroker`] in-process.

mod client;
mod connection;
mod memory;
mod rabbit;

pub use client::{AmqpChannel, AmqpConnector, AmqpSession, DisconnectHook, PendingConfirm};
pub use connection::{BrokerConnection, ConnectionPhase};
pub use memory::{topic_matches, MemoryBroker, PublishedMessage};
pub use rabbit::LapinConnector;

/// Connection parameters and the topology declared on every successful connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Topic exchange every record is published to
    pub exchange: String,
    pub queues: Vec<QueueSpec>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            exchange: "logs".to_string(),
            queues: Vec::new(),
        }
    }
}

/// A durable queue, optionally bound to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub binding: Option<String>,
}

/// Final state of a single publish, as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Confirmed,
    /// Nacked, or returned as unroutable
    Rejected,
    /// No confirmation could be obtained
    Failed,
}
