// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget statsd counters.
//!
//! Every increment is a single `<prefix>.<name>:1|c` datagram sent on a non-blocking socket.
//! Send failures are logged at trace level and otherwise ignored.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

pub const INPUT_HEROKU: &str = "input.heroku";
pub const INPUT_MULTILINE: &str = "input.multiline";
pub const INPUT_MOBILE: &str = "input.mobile";
pub const HEARTBEAT: &str = "heartbeat";
pub const TRUNCATE: &str = "truncate";
pub const AMQP_OUTPUT: &str = "amqp.output";
pub const AMQP_OUTPUT_DELIVERED: &str = "amqp.output_delivered";
pub const AMQP_OUTPUT_FAILURE: &str = "amqp.output_failure";
pub const AMQP_OUTPUT_EXCEPTION: &str = "amqp.output_exception";

#[derive(Debug)]
enum MetricSink {
    Udp(UdpSocket),
    /// Keeps every emitted line, for tests.
    Capture(Mutex<Vec<String>>),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct StatsdClient {
    prefix: String,
    sink: Arc<MetricSink>,
}

impl StatsdClient {
    /// Sends counters to `host:port`. The address is resolved once, here.
    pub fn udp(host: &str, port: u16, prefix: &str) -> io::Result<Self> {
        let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
        })?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        socket.connect(target)?;
        debug!("Sending metrics to {host}:{port} with prefix {prefix}");
        Ok(Self {
            prefix: prefix.to_string(),
            sink: Arc::new(MetricSink::Udp(socket)),
        })
    }

    pub fn capture(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            sink: Arc::new(MetricSink::Capture(Mutex::new(Vec::new()))),
        }
    }

    pub fn disabled() -> Self {
        Self {
            prefix: String::new(),
            sink: Arc::new(MetricSink::Disabled),
        }
    }

    fn line(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            format!("{name}:1|c")
        } else {
            format!("{}.{name}:1|c", self.prefix)
        }
    }

    pub fn incr(&self, name: &str) {
        let line = self.line(name);
        match self.sink.as_ref() {
            MetricSink::Udp(socket) => {
                if let Err(e) = socket.send(line.as_bytes()) {
                    trace!("Dropped metric {line}: {e}");
                }
            }
            MetricSink::Capture(lines) => {
                #[allow(clippy::expect_used)]
                lines.lock().expect("lock poisoned").push(line);
            }
            MetricSink::Disabled => {}
        }
    }

    /// Lines recorded by a capture client, empty for the other sinks.
    pub fn captured(&self) -> Vec<String> {
        match self.sink.as_ref() {
            #[allow(clippy::expect_used)]
            MetricSink::Capture(lines) => lines.lock().expect("lock poisoned").clone(),
            _ => Vec::new(),
        }
    }

    /// How many times `name` was incremented on a capture client.
    pub fn count_of(&self, name: &str) -> usize {
        let expected = self.line(name);
        self.captured()
            .iter()
            .filter(|line| **line == expected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_udp_sends_prefixed_counter() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let client = StatsdClient::udp("127.0.0.1", port, "heroku2logstash").unwrap();
        client.incr(INPUT_HEROKU);

        let mut buf = [0; 128];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"heroku2logstash.input.heroku:1|c");
    }

    #[test]
    fn test_capture_counts() {
        let client = StatsdClient::capture("h2l");
        client.incr(AMQP_OUTPUT);
        client.clone().incr(AMQP_OUTPUT);
        client.incr(AMQP_OUTPUT_DELIVERED);

        assert_eq!(client.count_of(AMQP_OUTPUT), 2);
        assert_eq!(client.count_of(AMQP_OUTPUT_DELIVERED), 1);
        assert_eq!(client.count_of(AMQP_OUTPUT_FAILURE), 0);
        assert_eq!(client.captured()[0], "h2l.amqp.output:1|c");
    }

    #[test]
    fn test_disabled_drops_everything() {
        let client = StatsdClient::disabled();
        client.incr(HEARTBEAT);
        assert!(client.captured().is_empty());
    }

    #[test]
    fn test_unreachable_target_does_not_fail() {
        // nothing listens on the discard port, sends must still return
        let client = StatsdClient::udp("127.0.0.1", 9, "h2l").unwrap();
        for _ in 0..10 {
            client.incr(TRUNCATE);
        }
    }
}
