// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

use crate::errors::RoutingError;

/// The four leading path segments of a drain URL: `/<type>/<parser_ver>/<env>/<app>/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOrigin {
    pub api: String,
    pub parser_ver: String,
    pub env: String,
    pub app: String,
}

impl DrainOrigin {
    pub fn from_path(path: &str) -> Result<Self, RoutingError> {
        let mut segments = path.trim_start_matches('/').split('/');
        let mut next = || {
            segments
                .next()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .ok_or_else(|| RoutingError {
                    path: path.to_string(),
                })
        };
        Ok(Self {
            api: next()?,
            parser_ver: next()?,
            env: next()?,
            app: next()?,
        })
    }

    pub fn routing_key(&self) -> String {
        format!("{}.{}.{}.{}", self.api, self.parser_ver, self.env, self.app)
    }
}

/// One log line and where it came from, in the shape published to the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub api: String,
    pub parser_ver: String,
    pub env: String,
    pub app: String,
    pub message: String,
    pub http_content_length: usize,
}

impl LogRecord {
    /// `http_content_length` is the byte length of `message` as it arrived.
    pub fn new(origin: &DrainOrigin, message: String) -> Self {
        Self {
            api: origin.api.clone(),
            parser_ver: origin.parser_ver.clone(),
            env: origin.env.clone(),
            app: origin.app.clone(),
            http_content_length: message.len(),
            message,
        }
    }

    /// Same provenance and arrival length, rewritten message.
    #[must_use]
    pub fn with_message(&self, message: String) -> Self {
        Self {
            message,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Routing key for records published as-is: `/mobile/v1/main/app` becomes `mobile.v1.main.app`.
pub fn raw_routing_key(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).replace('/', ".")
}
