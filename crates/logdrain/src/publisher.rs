// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Confirmed publishing on the shared broker connection.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, Instrument};

use crate::amqp::{BrokerConnection, DeliveryOutcome};
use crate::errors::PublishError;
use crate::metrics::{
    StatsdClient, AMQP_OUTPUT, AMQP_OUTPUT_DELIVERED, AMQP_OUTPUT_EXCEPTION, AMQP_OUTPUT_FAILURE,
};

/// Resolves to the broker's verdict on one published message.
#[derive(Debug)]
pub struct DeliveryReceipt {
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    pub async fn outcome(self) -> DeliveryOutcome {
        self.outcome.await.unwrap_or(DeliveryOutcome::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    statsd: StatsdClient,
    exchange: String,
    delivery_mode: u8,
}

impl Publisher {
    pub fn new(
        connection: Arc<BrokerConnection>,
        statsd: StatsdClient,
        exchange: impl Into<String>,
        delivery_mode: u8,
    ) -> Self {
        Self {
            connection,
            statsd,
            exchange: exchange.into(),
            delivery_mode,
        }
    }

    /// Publishes `payload` with `routing_key` on the configured exchange.
    ///
    /// Returns once the broker accepted the frame. The confirmation is tracked in the background
    /// and only feeds the delivery counters; awaiting the receipt is optional.
    pub async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
    ) -> Result<DeliveryReceipt, PublishError> {
        let channel = match self.connection.get_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.statsd.incr(AMQP_OUTPUT_EXCEPTION);
                error!(
                    "Error while pushing message to AMQP, exception: {e} routing_key: {routing_key}"
                );
                return Err(PublishError::Unavailable(e));
            }
        };

        self.statsd.incr(AMQP_OUTPUT);
        let pending = match channel
            .publish(&self.exchange, routing_key, payload, self.delivery_mode)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.statsd.incr(AMQP_OUTPUT_EXCEPTION);
                error!(
                    "Error while pushing message to AMQP, exception: {e} routing_key: {routing_key}"
                );
                debug!("Rejected payload: {}", String::from_utf8_lossy(payload));
                return Err(PublishError::Transport {
                    exchange: self.exchange.clone(),
                    routing_key: routing_key.to_string(),
                    source: e,
                });
            }
        };

        let (tx, rx) = oneshot::channel();
        let statsd = self.statsd.clone();
        let routing_key = routing_key.to_string();
        tokio::spawn(
            async move {
                let outcome = pending.await;
                match outcome {
                    DeliveryOutcome::Confirmed => statsd.incr(AMQP_OUTPUT_DELIVERED),
                    DeliveryOutcome::Rejected | DeliveryOutcome::Failed => {
                        error!(
                            "delivery_confirmation failed {outcome:?} routing_key: {routing_key}"
                        );
                        statsd.incr(AMQP_OUTPUT_FAILURE);
                    }
                }
                // nobody may be waiting on the receipt
                let _ = tx.send(outcome);
            }
            .in_current_span(),
        );

        Ok(DeliveryReceipt { outcome: rx })
    }
}
