// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log drain ingestion.
//!
//! Receives syslog drains (octet-counted, RFC6587) and generic client posts over HTTP, rewrites
//! each record through a configurable transform chain, and republishes it on an AMQP topic
//! exchange with publisher confirms enabled.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod amqp;
pub mod config;
pub mod errors;
pub mod filters;
pub mod handlers;
pub mod http_utils;
pub mod metrics;
pub mod publisher;
pub mod record;
pub mod relay;
pub mod splitter;
pub mod transform;
