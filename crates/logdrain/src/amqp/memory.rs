// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process broker.
//!
//! Routes published messages through topic bindings the way RabbitMQ does and keeps them per
//! queue. It also lets callers hold connection attempts, fail them, reject deliveries and drop
//! live connections, so the connection lifecycle can be driven deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::client::{AmqpChannel, AmqpConnector, AmqpSession, DisconnectHook, PendingConfirm};
use super::{BrokerSettings, DeliveryOutcome};
use crate::errors::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_mode: u8,
}

#[derive(Default)]
struct Topology {
    exchanges: Vec<String>,
    queues: BTreeMap<String, Vec<Vec<u8>>>,
    /// (queue, exchange, binding key)
    bindings: Vec<(String, String, String)>,
    published: Vec<PublishedMessage>,
    sessions: Vec<Weak<MemorySession>>,
}

struct Shared {
    retain: bool,
    topology: Mutex<Topology>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    next_channel_id: AtomicU16,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    reject_deliveries: AtomicBool,
    gate: watch::Sender<bool>,
    declare_gate: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker that keeps every message and rejects unroutable ones.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A broker that confirms and drops every message.
    pub fn discarding() -> Self {
        Self::build(false)
    }

    fn build(retain: bool) -> Self {
        let (gate, _) = watch::channel(true);
        let (declare_gate, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                retain,
                topology: Mutex::new(Topology::default()),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                next_channel_id: AtomicU16::new(1),
                fail_connect: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                reject_deliveries: AtomicBool::new(false),
                gate,
                declare_gate,
            }),
        }
    }

    #[allow(clippy::expect_used)]
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.shared.topology.lock().expect("lock poisoned")
    }

    /// Connection attempts wait until [`MemoryBroker::release_connects`].
    pub fn hold_connects(&self) {
        self.shared.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.shared.gate.send_replace(true);
    }

    /// Queue declarations wait until [`MemoryBroker::release_declarations`].
    pub fn hold_declarations(&self) {
        self.shared.declare_gate.send_replace(false);
    }

    pub fn release_declarations(&self) {
        self.shared.declare_gate.send_replace(true);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn reject_deliveries(&self, reject: bool) {
        self.shared.reject_deliveries.store(reject, Ordering::SeqCst);
    }

    /// Drops every live connection as if the broker went away.
    pub fn disconnect_all(&self, reason: &str) {
        let sessions: Vec<Arc<MemorySession>> = self
            .topology()
            .sessions
            .drain(..)
            .filter_map(|session| session.upgrade())
            .collect();
        for session in sessions {
            session.drop_connection(reason);
        }
    }

    /// Number of connection attempts that reached the broker.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed by the client.
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.topology().exchanges.clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.topology().queues.keys().cloned().collect()
    }

    /// Messages routed to `queue`, oldest first.
    pub fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.topology()
            .queues
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.topology().published.clone()
    }

    fn route(&self, message: PublishedMessage) -> Result<DeliveryOutcome, BrokerError> {
        let mut topology = self.topology();
        if !topology.exchanges.contains(&message.exchange) {
            return Err(BrokerError::Publish(format!(
                "no exchange '{}'",
                message.exchange
            )));
        }
        if !self.shared.retain {
            return Ok(DeliveryOutcome::Confirmed);
        }

        let targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|(_, exchange, key)| {
                *exchange == message.exchange && topic_matches(key, &message.routing_key)
            })
            .map(|(queue, _, _)| queue.clone())
            .collect();
        for queue in &targets {
            if let Some(messages) = topology.queues.get_mut(queue) {
                messages.push(message.payload.clone());
            }
        }
        topology.published.push(message);

        if self.shared.reject_deliveries.load(Ordering::SeqCst) || targets.is_empty() {
            Ok(DeliveryOutcome::Rejected)
        } else {
            Ok(DeliveryOutcome::Confirmed)
        }
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    async fn connect(
        &self,
        settings: &BrokerSettings,
    ) -> Result<Arc<dyn AmqpSession>, BrokerError> {
        let mut gate = self.shared.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| BrokerError::Connect("broker shut down".to_string()))?;

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect(format!(
                "connection refused by {}:{}",
                settings.host, settings.port
            )));
        }

        let session = Arc::new(MemorySession {
            broker: self.clone(),
            connected: Arc::new(AtomicBool::new(true)),
            hooks: Mutex::new(Vec::new()),
        });
        self.topology().sessions.push(Arc::downgrade(&session));
        debug!("In-memory broker accepted a connection");
        Ok(session)
    }
}

struct MemorySession {
    broker: MemoryBroker,
    connected: Arc<AtomicBool>,
    hooks: Mutex<Vec<DisconnectHook>>,
}

impl MemorySession {
    fn drop_connection(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        #[allow(clippy::expect_used)]
        let hooks = std::mem::take(&mut *self.hooks.lock().expect("lock poisoned"));
        for hook in hooks {
            hook(reason.to_string());
        }
    }
}

#[async_trait]
impl AmqpSession for MemorySession {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }
        let id = self.broker.shared.next_channel_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            connected: Arc::clone(&self.connected),
            open: AtomicBool::new(true),
            confirms: AtomicBool::new(false),
        }))
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        #[allow(clippy::expect_used)]
        self.hooks.lock().expect("lock poisoned").push(hook);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MemoryChannel {
    id: u16,
    broker: MemoryBroker,
    /// Shared with the owning session
    connected: Arc<AtomicBool>,
    open: AtomicBool,
    confirms: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Closed(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.topology();
        if !topology.exchanges.iter().any(|exchange| exchange == name) {
            topology.exchanges.push(name.to_string());
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut gate = self.broker.shared.declare_gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| BrokerError::Closed("broker shut down".to_string()))?;
        self.ensure_open()?;
        self.broker
            .topology()
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.broker.topology();
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::Declare {
                what: format!("binding {binding_key} for queue {queue}"),
                reason: "no such queue".to_string(),
            });
        }
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            binding_key.to_string(),
        );
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        delivery_mode: u8,
    ) -> Result<PendingConfirm, BrokerError> {
        self.ensure_open()?;
        if self.broker.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("publish refused".to_string()));
        }
        let outcome = self.broker.route(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            delivery_mode,
        })?;
        let outcome = if self.confirms.load(Ordering::SeqCst) {
            outcome
        } else {
            DeliveryOutcome::Confirmed
        };
        Ok(Box::pin(std::future::ready(outcome)))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// AMQP topic matching: `*` stands for exactly one word, `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => {
                    (word == "*" || word == first) && matches(rest, key_rest)
                }
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
