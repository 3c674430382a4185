// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::str::FromStr;

use crate::amqp::{BrokerSettings, QueueSpec};
use crate::errors::ConfigError;
use crate::filters::{self, Filters};
use crate::transform::{self, PluginTable, WILDCARD};

const DEFAULT_APIS: &str = "heroku:v1,api:heartbeat,api:healthcheck";
const DEFAULT_HANDLERS: &str =
    "HerokuHandler:heroku:v1,HealthCheckHandler:api:healthcheck,HealthCheckHandler:api:heartbeat";
const DEFAULT_PLUGINS: &str = "truncate,obfuscate_token:heroku:v1";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The ingestion behaviours a route can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    HealthCheck,
    GenericApi,
    GenericAmqp,
    MultiLine,
    Heroku,
    Heroku2,
}

impl HandlerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HealthCheck => "HealthCheckHandler",
            Self::GenericApi => "GenericAPIHandler",
            Self::GenericAmqp => "GenericAMQPHandler",
            Self::MultiLine => "MultiLineHandler",
            Self::Heroku => "HerokuHandler",
            Self::Heroku2 => "HerokuHandler2",
        }
    }
}

impl FromStr for HandlerKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "HealthCheckHandler" => Ok(Self::HealthCheck),
            "GenericAPIHandler" => Ok(Self::GenericApi),
            "GenericAMQPHandler" => Ok(Self::GenericAmqp),
            "MultiLineHandler" => Ok(Self::MultiLine),
            "HerokuHandler" => Ok(Self::Heroku),
            "HerokuHandler2" => Ok(Self::Heroku2),
            other => Err(ConfigError::UnknownHandler(other.to_string())),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRoute {
    pub kind: HandlerKind,
    pub api: String,
    pub ver: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub environments: Vec<String>,
    /// `api:ver` pairs; the api part names the per-environment queues
    pub apis: Vec<String>,
    pub handlers: Vec<HandlerRoute>,
    pub plugins: PluginTable,
    pub filters: Filters,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub metrics_prefix: String,
    /// When false records go to an in-process broker instead of RabbitMQ
    pub amqp_activated: bool,
    pub amqp_exchange: String,
    pub amqp_host: String,
    pub amqp_port: u16,
    pub amqp_user: String,
    pub amqp_password: String,
    /// 1 transient, 2 persistent
    pub amqp_delivery_mode: u8,
    /// Also bind each queue to `<api>.*.<env>.#`
    pub amqp_bind_queues: bool,
    pub max_request_content_length: usize,
}

impl Default for Config {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self::from_lookup(|_| None).expect("default configuration is valid")
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let max_msg_length: i64 = vars.parse(
            "TRUNCATE_MAX_MSG_LENGTH",
            "an integer",
            filters::DEFAULT_MAX_MSG_LENGTH as i64,
        )?;
        let filters = Filters::new(
            vars.flag("TRUNCATE_ACTIVATION", true)?,
            usize::try_from(max_msg_length).ok(),
            &vars.string("TRUNCATE_EXCEPT_STACK_PATTERN", filters::DEFAULT_STACK_PATTERN),
            &vars.string("REPLACE_TOKEN_PATTERN", filters::DEFAULT_TOKEN_PATTERN),
        )?;

        let config = Self {
            listen_port: vars.parse("LISTEN_PORT", "a port number", 8080)?,
            log_level: vars.string("LOG_LEVEL", "info").to_lowercase(),
            environments: split_list(&vars.string("ENVIRONMENTS", "main")),
            apis: split_list(&vars.string("APIS", DEFAULT_APIS)),
            handlers: parse_handlers(&vars.string("HANDLERS", DEFAULT_HANDLERS))?,
            plugins: parse_plugins(&vars.string("PLUGINS", DEFAULT_PLUGINS))?,
            filters,
            metrics_host: vars.string("METRICS_HOST", "localhost"),
            metrics_port: vars.parse("METRICS_PORT", "a port number", 8125)?,
            metrics_prefix: vars.string("METRICS_PREFIX", "heroku2logstash"),
            amqp_activated: vars.flag("AMQP_ACTIVATION", true)?,
            amqp_exchange: vars.string("AMQP_MAIN_EXCHANGE", "logs"),
            amqp_host: vars.string("AMQP_HOST", "localhost"),
            amqp_port: vars.parse("AMQP_PORT", "a port number", 5672)?,
            amqp_user: vars.string("AMQP_USER", "guest"),
            amqp_password: vars.string("AMQP_PASSWORD", "guest"),
            amqp_delivery_mode: vars.parse("AMQP_DELIVERY_MODE", "1 or 2", 1)?,
            amqp_bind_queues: vars.flag("AMQP_BIND_QUEUES", false)?,
            max_request_content_length: vars.parse(
                "MAX_REQUEST_CONTENT_LENGTH",
                "a size in bytes",
                10 * 1024 * 1024, // 10MB in Bytes
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 || self.metrics_port == 0 || self.amqp_port == 0 {
            return Err(ConfigError::Invalid(
                "ports must be greater than 0".to_string(),
            ));
        }

        if self.environments.is_empty() {
            return Err(ConfigError::Invalid(
                "ENVIRONMENTS cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if !matches!(self.amqp_delivery_mode, 1 | 2) {
            return Err(ConfigError::InvalidValue {
                name: "AMQP_DELIVERY_MODE",
                expected: "1 or 2",
                value: self.amqp_delivery_mode.to_string(),
            });
        }

        if self.amqp_exchange.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "AMQP_MAIN_EXCHANGE cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// One `<api>_<env>_queue` per distinct api and environment, in configuration order.
    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        let mut apis: Vec<&str> = Vec::new();
        for entry in &self.apis {
            let api = entry.split(':').next().unwrap_or_default();
            if !api.is_empty() && !apis.contains(&api) {
                apis.push(api);
            }
        }

        apis.iter()
            .flat_map(|api| {
                self.environments.iter().map(move |env| QueueSpec {
                    name: format!("{api}_{env}_queue"),
                    binding: self
                        .amqp_bind_queues
                        .then(|| format!("{api}.*.{env}.#")),
                })
            })
            .collect()
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.amqp_host.clone(),
            port: self.amqp_port,
            user: self.amqp_user.clone(),
            password: self.amqp_password.clone(),
            exchange: self.amqp_exchange.clone(),
            queues: self.queue_specs(),
        }
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str, default: &str) -> String {
        (self.0)(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(
        &self,
        name: &'static str,
        expected: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        match (self.0)(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name,
                expected,
                value,
            }),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match (self.0)(name) {
            None => Ok(default),
            Some(value) => match value.trim().to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    name,
                    expected: "true or false",
                    value,
                }),
            },
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// `name[:api[:ver]]`, missing parts defaulting to the wildcard.
fn parse_entries(value: &str) -> impl Iterator<Item = (String, String, String)> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split(':');
            let name = parts.next().unwrap_or_default().to_string();
            let api = parts.next().unwrap_or(WILDCARD).to_string();
            let ver = parts.next().unwrap_or(WILDCARD).to_string();
            (name, api, ver)
        })
}

fn parse_handlers(value: &str) -> Result<Vec<HandlerRoute>, ConfigError> {
    parse_entries(value)
        .map(|(name, api, ver)| -> Result<HandlerRoute, ConfigError> {
            Ok(HandlerRoute {
                kind: name.parse()?,
                api,
                ver,
            })
        })
        .collect()
}

fn parse_plugins(value: &str) -> Result<PluginTable, ConfigError> {
    let mut table = PluginTable::default();
    for (name, api, ver) in parse_entries(value) {
        let transform =
            transform::lookup(&name).ok_or_else(|| ConfigError::UnknownPlugin(name.clone()))?;
        table.insert(&api, &ver, transform);
    }
    Ok(table)
}
