// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use logdrain::amqp::{BrokerConnection, MemoryBroker};
use logdrain::config::Config;
use logdrain::metrics::StatsdClient;
use logdrain::publisher::Publisher;
use logdrain::relay::{self, Relay};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A relay served on an ephemeral local port, publishing to an in-memory broker.
pub struct TestServer {
    pub port: u16,
    pub broker: MemoryBroker,
    pub statsd: StatsdClient,
    pub connection: Arc<BrokerConnection>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        let broker = MemoryBroker::new();
        let statsd = StatsdClient::capture("heroku2logstash");
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            config.broker_settings(),
        ));
        let publisher = Publisher::new(
            Arc::clone(&connection),
            statsd.clone(),
            config.amqp_exchange.clone(),
            config.amqp_delivery_mode,
        );
        let relay = Arc::new(Relay::new(Arc::new(config), publisher, statsd.clone()));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let port = listener.local_addr().expect("Missing local address").port();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(relay::serve(listener, relay, shutdown.clone()));

        Self {
            port,
            broker,
            statsd,
            connection,
            shutdown,
            server,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.server
            .await
            .expect("Server task panicked")
            .expect("Server failed");
        self.connection.close().await;
    }
}

/// Configuration read from `vars` only, ignoring the process environment.
pub fn config_from(vars: &[(&str, &str)]) -> Config {
    Config::from_lookup(|name| {
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    })
    .expect("Invalid test configuration")
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Content-Type", "application/logplex-1");

    let request = if let Some(body_data) = body {
        request_builder = request_builder.header("Content-Length", body_data.len().to_string());
        request_builder.body(Full::new(Bytes::from(body_data)))?
    } else {
        request_builder.body(Full::new(Bytes::new()))?
    };

    Ok(timeout(Duration::from_secs(2), sender.send_request(request)).await??)
}

/// Frames `records` the way a Heroku drain does, one newline-terminated frame per record.
pub fn octet_frames(records: &[&str]) -> Vec<u8> {
    records
        .iter()
        .map(|record| format!("{} {record}\n", record.len() + 1))
        .collect::<String>()
        .into_bytes()
}
