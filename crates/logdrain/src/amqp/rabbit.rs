// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RabbitMQ client backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error};

use super::client::{AmqpChannel, AmqpConnector, AmqpSession, DisconnectHook, PendingConfirm};
use super::{BrokerSettings, DeliveryOutcome};
use crate::errors::BrokerError;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(
        &self,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn AmqpSession>, BrokerError> {
        let uri = AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: settings.user.clone(),
                    password: settings.password.clone(),
                },
                host: settings.host.clone(),
                port: settings.port,
            },
            ..Default::default()
        };
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Arc::new(LapinSession { connection }))
    }
}

struct LapinSession {
    connection: Connection,
}

#[async_trait]
impl AmqpSession for LapinSession {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        self.connection.on_error(move |err| hook(err.to_string()));
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "closing").await {
            debug!("Error while closing AMQP connection: {e}");
        }
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                what: format!("exchange {name}"),
                reason: e.to_string(),
            })
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Confirms(e.to_string()))
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare {
                what: format!("queue {name}"),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                what: format!("binding {binding_key} for queue {queue}"),
                reason: e.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        delivery_mode: u8,
    ) -> Result<PendingConfirm, BrokerError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let properties = BasicProperties::default().with_delivery_mode(delivery_mode);
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                    DeliveryOutcome::Confirmed
                }
                Ok(Confirmation::Ack(Some(returned))) => {
                    error!(
                        "Message returned as unroutable: {} {}",
                        returned.reply_code,
                        returned.reply_text.as_str()
                    );
                    DeliveryOutcome::Rejected
                }
                Ok(Confirmation::Nack(_)) => DeliveryOutcome::Rejected,
                Err(e) => {
                    error!("Publisher confirmation lost: {e}");
                    DeliveryOutcome::Failed
                }
            }
        }))
    }

    async fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "closing").await {
            debug!("Error while closing AMQP channel: {e}");
        }
    }
}
