// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the ingestion pipeline.

/// Malformed framed input. The whole request is rejected, nothing is published.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("no length prefix separator found at offset {offset}")]
    MissingSeparator { offset: usize },

    #[error("invalid length prefix {prefix:?} at offset {offset}")]
    InvalidLength { offset: usize, prefix: String },

    #[error("frame at offset {offset} declares {declared} bytes but only {remaining} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("length token {0:?} is not followed by a message")]
    MissingMessage(String),
}

/// A transform refused a record. Only that record is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transform {name} failed: {reason}")]
pub struct TransformError {
    pub name: &'static str,
    pub reason: String,
}

/// Failures of the broker connection or its handshake.
///
/// Cloneable so that every caller waiting on the same handshake receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare {what}: {reason}")]
    Declare { what: String, reason: String },

    #[error("failed to enable publisher confirms: {0}")]
    Confirms(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("broker connection closed: {0}")]
    Closed(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Synchronous publish failure, surfaced to the HTTP caller.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(#[source] BrokerError),

    #[error("publish to {exchange} with routing key {routing_key} failed: {source}")]
    Transport {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },
}

/// The request path does not carry the expected routing segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("path {path:?} must contain type, parser version, environment and app segments")]
pub struct RoutingError {
    pub path: String,
}

/// Invalid configuration, reported at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{name} is not a valid regular expression: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    #[error("unknown handler {0:?}")]
    UnknownHandler(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything that can fail while ingesting one request.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}
