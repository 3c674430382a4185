// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logdrain::{
    amqp::{AmqpConnector, BrokerConnection, LapinConnector, MemoryBroker},
    config::Config,
    metrics::StatsdClient,
    publisher::Publisher,
    relay::{self, Relay},
};

const LISTEN_HOST: [u8; 4] = [0, 0, 0, 0];

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env().context("invalid configuration")?);

    let env_filter = format!(
        "h2=off,hyper=off,lapin=off,pinky_swear=off,{}",
        config.log_level
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let statsd = match StatsdClient::udp(
        &config.metrics_host,
        config.metrics_port,
        &config.metrics_prefix,
    ) {
        Ok(statsd) => statsd,
        Err(e) => {
            error!(
                "Unable to send metrics to {}:{}, metrics disabled: {e}",
                config.metrics_host, config.metrics_port
            );
            StatsdClient::disabled()
        }
    };

    let connector: Arc<dyn AmqpConnector> = if config.amqp_activated {
        Arc::new(LapinConnector)
    } else {
        info!("AMQP output deactivated, records are discarded");
        Arc::new(MemoryBroker::discarding())
    };
    let connection = Arc::new(BrokerConnection::new(connector, config.broker_settings()));

    let eager = Arc::clone(&connection);
    tokio::spawn(async move {
        match eager.get_channel().await {
            Ok(channel) => info!("AMQP is connected, channel {}", channel.id()),
            Err(e) => error!("AMQP is not connected yet: {e}"),
        }
    });

    let publisher = Publisher::new(
        Arc::clone(&connection),
        statsd.clone(),
        config.amqp_exchange.clone(),
        config.amqp_delivery_mode,
    );
    let relay = Arc::new(Relay::new(Arc::clone(&config), publisher, statsd));

    let addr = SocketAddr::from((LISTEN_HOST, config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to listen on {addr}"))?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(relay::serve(listener, relay, shutdown.clone()));

    tokio::select! {
        result = &mut server => {
            error!("HTTP server stopped unexpectedly: {result:?}");
            connection.close().await;
            result??;
            anyhow::bail!("HTTP server stopped unexpectedly");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("unable to listen for the shutdown signal")?;
            info!("Shutting down");
        }
    }

    shutdown.cancel();
    let served = server.await;
    connection.close().await;
    served??;
    Ok(())
}
