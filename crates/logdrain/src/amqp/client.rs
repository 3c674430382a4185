// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BrokerSettings, DeliveryOutcome};
use crate::errors::BrokerError;

/// Resolves once the broker acked, nacked or dropped a published message.
pub type PendingConfirm = Pin<Box<dyn Future<Output = DeliveryOutcome> + Send>>;

/// Called with a reason when the broker closes the connection on its own.
pub type DisconnectHook = Box<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, settings: &BrokerSettings)
        -> Result<Arc<dyn AmqpSession>, BrokerError>;
}

#[async_trait]
pub trait AmqpSession: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError>;

    /// Registers a hook fired on broker-initiated disconnects, not on [`AmqpSession::close`].
    fn on_disconnect(&self, hook: DisconnectHook);

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Declares a non-durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    /// Declares a durable, non-exclusive queue that is never auto-deleted.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes with `mandatory` set. The returned future tracks the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        delivery_mode: u8,
    ) -> Result<PendingConfirm, BrokerError>;

    async fn close(&self);
}
