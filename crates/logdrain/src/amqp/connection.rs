// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared broker connection and its handshake.
//!
//! A handshake walks `Connecting → ChannelOpening → ExchangeDeclaring → QueuesDeclaring → Ready`
//! in a spawned task, one transition per step. Progress is published through a `watch` channel,
//! so any number of callers can wait on the same attempt. Starting or joining an attempt is
//! decided under a short non-async lock: at most one handshake is ever in flight.
//!
//! Every attempt gets a new generation. A transition, or a disconnect notification, only
//! applies to the generation it was issued for; [`BrokerConnection::close`] bumps the
//! generation, which releases all waiters with [`BrokerError::Cancelled`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::client::{AmqpChannel, AmqpConnector, AmqpSession, DisconnectHook};
use super::BrokerSettings;
use crate::errors::BrokerError;

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    ChannelOpening,
    ExchangeDeclaring,
    QueuesDeclaring,
    Ready,
    Failed,
}

#[derive(Clone)]
struct Link {
    session: Arc<dyn AmqpSession>,
    channel: Arc<dyn AmqpChannel>,
}

impl Link {
    fn is_usable(&self) -> bool {
        self.session.is_connected() && self.channel.is_open()
    }

    async fn close(&self) {
        self.channel.close().await;
        self.session.close().await;
    }
}

#[derive(Clone)]
enum ConnectionState {
    Disconnected,
    Connecting,
    ChannelOpening,
    ExchangeDeclaring,
    QueuesDeclaring,
    Ready(Link),
    Failed(BrokerError),
}

impl ConnectionState {
    fn phase(&self) -> ConnectionPhase {
        match self {
            Self::Disconnected => ConnectionPhase::Disconnected,
            Self::Connecting => ConnectionPhase::Connecting,
            Self::ChannelOpening => ConnectionPhase::ChannelOpening,
            Self::ExchangeDeclaring => ConnectionPhase::ExchangeDeclaring,
            Self::QueuesDeclaring => ConnectionPhase::QueuesDeclaring,
            Self::Ready(_) => ConnectionPhase::Ready,
            Self::Failed(_) => ConnectionPhase::Failed,
        }
    }

    fn in_progress(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::ChannelOpening
                | Self::ExchangeDeclaring
                | Self::QueuesDeclaring
        )
    }
}

#[derive(Clone)]
struct Snapshot {
    generation: u64,
    state: ConnectionState,
}

type StateTx = watch::Sender<Snapshot>;

/// Applies `next` if the attempt of `generation` is still the live one and still in progress.
fn advance(state: &StateTx, generation: u64, next: ConnectionState) -> bool {
    state.send_if_modified(|snapshot| {
        if snapshot.generation != generation || !snapshot.state.in_progress() {
            return false;
        }
        snapshot.state = next;
        true
    })
}

/// Pending steps of a handshake, each holding only what its transition needs.
enum Handshake {
    Connecting,
    ChannelOpening {
        session: Arc<dyn AmqpSession>,
    },
    ExchangeDeclaring {
        session: Arc<dyn AmqpSession>,
        channel: Arc<dyn AmqpChannel>,
    },
    QueuesDeclaring {
        session: Arc<dyn AmqpSession>,
        channel: Arc<dyn AmqpChannel>,
    },
}

enum Step {
    Next(Handshake),
    Ready(Link),
}

struct HandshakeContext {
    connector: Arc<dyn AmqpConnector>,
    settings: Arc<BrokerSettings>,
    state: Weak<StateTx>,
    generation: u64,
    cancel: CancellationToken,
}

/// The spawned handshake and the token asking it to stop.
struct RunningHandshake {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Handshake {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Connecting => ConnectionState::Connecting,
            Self::ChannelOpening { .. } => ConnectionState::ChannelOpening,
            Self::ExchangeDeclaring { .. } => ConnectionState::ExchangeDeclaring,
            Self::QueuesDeclaring { .. } => ConnectionState::QueuesDeclaring,
        }
    }

    fn session(&self) -> Option<&Arc<dyn AmqpSession>> {
        match self {
            Self::Connecting => None,
            Self::ChannelOpening { session }
            | Self::ExchangeDeclaring { session, .. }
            | Self::QueuesDeclaring { session, .. } => Some(session),
        }
    }

    async fn step(self, ctx: &HandshakeContext) -> Result<Step, BrokerError> {
        let settings = &ctx.settings;
        match self {
            Self::Connecting => {
                info!(
                    "AMQP connecting to: exchange:{} host:{} port:{}",
                    settings.exchange, settings.host, settings.port
                );
                let session = ctx.connector.connect(settings).await?;
                session.on_disconnect(disconnect_hook(ctx));
                info!(
                    "AMQP is connected exchange:{} host:{} port:{}",
                    settings.exchange, settings.host, settings.port
                );
                Ok(Step::Next(Self::ChannelOpening { session }))
            }
            Self::ChannelOpening { session } => {
                let channel = session.open_channel().await?;
                info!("channel open {}", channel.id());
                Ok(Step::Next(Self::ExchangeDeclaring { session, channel }))
            }
            Self::ExchangeDeclaring { session, channel } => {
                tokio::try_join!(
                    channel.declare_exchange(&settings.exchange),
                    channel.enable_confirms()
                )?;
                Ok(Step::Next(Self::QueuesDeclaring { session, channel }))
            }
            Self::QueuesDeclaring { session, channel } => {
                let mut declarations = JoinSet::new();
                for queue in settings.queues.iter().cloned() {
                    let channel = Arc::clone(&channel);
                    let exchange = settings.exchange.clone();
                    declarations.spawn(
                        async move {
                            info!("Queue declare:{}", queue.name);
                            channel.declare_queue(&queue.name).await?;
                            if let Some(binding) = &queue.binding {
                                channel.bind_queue(&queue.name, &exchange, binding).await?;
                            }
                            Ok::<_, BrokerError>(())
                        }
                        .in_current_span(),
                    );
                }
                while let Some(declared) = declarations.join_next().await {
                    declared.map_err(|e| BrokerError::Declare {
                        what: "queues".to_string(),
                        reason: e.to_string(),
                    })??;
                }
                info!(
                    "Exchange is declared:{} host:{} port:{}",
                    settings.exchange, settings.host, settings.port
                );
                Ok(Step::Ready(Link { session, channel }))
            }
        }
    }
}

/// Ready goes back to Disconnected; an attempt still in progress fails.
fn disconnect_hook(ctx: &HandshakeContext) -> DisconnectHook {
    let state = Weak::clone(&ctx.state);
    let generation = ctx.generation;
    let settings = Arc::clone(&ctx.settings);
    Box::new(move |reason| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let changed = state.send_if_modified(|snapshot| {
            if snapshot.generation != generation {
                return false;
            }
            if matches!(snapshot.state, ConnectionState::Ready(_)) {
                snapshot.state = ConnectionState::Disconnected;
                return true;
            }
            if snapshot.state.in_progress() {
                snapshot.state = ConnectionState::Failed(BrokerError::Closed(reason.clone()));
                return true;
            }
            false
        });
        if changed {
            error!(
                "AMQP is disconnected from exchange:{} host:{} port:{} reason:{}",
                settings.exchange, settings.host, settings.port, reason
            );
        }
    })
}

async fn run_handshake(ctx: HandshakeContext) {
    let mut handshake = Handshake::Connecting;
    loop {
        let Some(state) = ctx.state.upgrade() else {
            return;
        };
        let session = handshake.session().cloned();
        // a finished step wins, its session is then closed on the superseded path
        let stepped = tokio::select! {
            biased;
            stepped = handshake.step(&ctx) => stepped,
            () = ctx.cancel.cancelled() => {
                debug!("AMQP handshake cancelled");
                if let Some(session) = &session {
                    session.close().await;
                }
                return;
            }
        };
        match stepped {
            Ok(Step::Next(next)) => {
                if !advance(&state, ctx.generation, next.state()) {
                    debug!("AMQP handshake superseded");
                    if let Some(session) = next.session() {
                        session.close().await;
                    }
                    return;
                }
                handshake = next;
            }
            Ok(Step::Ready(link)) => {
                if !advance(&state, ctx.generation, ConnectionState::Ready(link.clone())) {
                    debug!("AMQP handshake superseded");
                    link.close().await;
                }
                return;
            }
            Err(err) => {
                error!("AMQP handshake failed: {err}");
                if let Some(session) = session {
                    session.close().await;
                }
                advance(&state, ctx.generation, ConnectionState::Failed(err));
                return;
            }
        }
    }
}

/// One logical broker connection shared by every publisher.
pub struct BrokerConnection {
    connector: Arc<dyn AmqpConnector>,
    settings: Arc<BrokerSettings>,
    state: Arc<StateTx>,
    handshake: Mutex<Option<RunningHandshake>>,
    attempts: AtomicU64,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("settings", &self.settings)
            .field("phase", &self.phase())
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn AmqpConnector>, settings: BrokerSettings) -> Self {
        let (state, _) = watch::channel(Snapshot {
            generation: 0,
            state: ConnectionState::Disconnected,
        });
        Self {
            connector,
            settings: Arc::new(settings),
            state: Arc::new(state),
            handshake: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.borrow().state.phase()
    }

    /// Number of handshakes started so far.
    pub fn handshake_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the ready channel, joining the handshake in flight or starting a new one.
    pub async fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        let generation = self.ensure_handshake();
        let mut rx = self.state.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| {
                snapshot.generation != generation || !snapshot.state.in_progress()
            })
            .await
            .map_err(|_| BrokerError::Cancelled)?;

        if snapshot.generation != generation {
            return Err(BrokerError::Cancelled);
        }
        match &snapshot.state {
            ConnectionState::Ready(link) => Ok(Arc::clone(&link.channel)),
            ConnectionState::Failed(err) => Err(err.clone()),
            _ => Err(BrokerError::Closed(
                "connection lost before it could be used".to_string(),
            )),
        }
    }

    /// Start-or-join, returning the generation to wait on.
    fn ensure_handshake(&self) -> u64 {
        #[allow(clippy::expect_used)]
        let mut handshake = self.handshake.lock().expect("lock poisoned");
        let running = handshake
            .as_ref()
            .is_some_and(|running| !running.task.is_finished());

        let stale = {
            let current = self.state.borrow();
            match &current.state {
                ConnectionState::Ready(link) if link.is_usable() => {
                    return current.generation;
                }
                state if state.in_progress() && running => return current.generation,
                ConnectionState::Ready(link) => Some(link.clone()),
                _ => None,
            }
        };
        if let Some(link) = stale {
            debug!("AMQP channel {} is closed, reconnecting", link.channel.id());
            tokio::spawn(async move { link.close().await });
        }

        let mut generation = 0;
        self.state.send_modify(|snapshot| {
            snapshot.generation += 1;
            snapshot.state = ConnectionState::Connecting;
            generation = snapshot.generation;
        });
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let ctx = HandshakeContext {
            connector: Arc::clone(&self.connector),
            settings: Arc::clone(&self.settings),
            state: Arc::downgrade(&self.state),
            generation,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run_handshake(ctx).in_current_span());
        *handshake = Some(RunningHandshake { task, cancel });
        generation
    }

    /// Stops any handshake, closes the live connection and releases every waiter.
    ///
    /// A handshake that already holds a connection closes it before this returns.
    pub async fn close(&self) {
        let (running, link) = {
            #[allow(clippy::expect_used)]
            let mut handshake = self.handshake.lock().expect("lock poisoned");
            let running = handshake.take();
            if let Some(running) = &running {
                running.cancel.cancel();
            }
            let link = match reset(&self.state) {
                ConnectionState::Ready(link) => Some(link),
                _ => None,
            };
            (running, link)
        };
        if let Some(running) = running {
            if let Err(e) = running.task.await {
                error!("AMQP handshake task failed: {e}");
            }
        }
        if let Some(link) = link {
            link.close().await;
            info!("AMQP connection closed");
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Ok(mut handshake) = self.handshake.lock() {
            if let Some(running) = handshake.take() {
                running.cancel.cancel();
            }
        }
    }
}

/// Bumps the generation and goes back to Disconnected, returning the replaced state.
fn reset(state: &StateTx) -> ConnectionState {
    let mut previous = ConnectionState::Disconnected;
    state.send_modify(|snapshot| {
        snapshot.generation += 1;
        previous = std::mem::replace(&mut snapshot.state, ConnectionState::Disconnected);
    });
    previous
}
