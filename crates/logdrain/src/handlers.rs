// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Route handlers.
//!
//! Each configured route owns a [`Handler`]: the handler kind, the `api`/`ver` pair it serves and
//! the transform chain resolved for that pair. Handlers share one [`Pipeline`] holding the
//! splitter, the publisher and the statsd client.

use hyper::Method;
use tracing::{debug, error};

use crate::config::{HandlerKind, HandlerRoute};
use crate::errors::IngestError;
use crate::filters::Filters;
use crate::metrics::{
    StatsdClient, HEARTBEAT, INPUT_HEROKU, INPUT_MOBILE, INPUT_MULTILINE, TRUNCATE,
};
use crate::publisher::Publisher;
use crate::record::{raw_routing_key, DrainOrigin, LogRecord};
use crate::splitter::{split_multiline, Splitter};
use crate::transform::{PluginTable, TransformChain, WILDCARD};

/// Collaborators shared by every handler.
#[derive(Debug, Clone)]
pub struct Pipeline {
    splitter: Splitter,
    publisher: Publisher,
    statsd: StatsdClient,
}

impl Pipeline {
    pub fn new(splitter: Splitter, publisher: Publisher, statsd: StatsdClient) -> Self {
        Self {
            splitter,
            publisher,
            statsd,
        }
    }

    pub fn filters(&self) -> &Filters {
        self.splitter.filters()
    }

    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }
}

/// Where the records of one request are published.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    /// As-is, under the given routing key
    Raw(&'a str),
    /// Wrapped in a JSON [`LogRecord`]
    Record(&'a DrainOrigin),
}

#[derive(Debug, Clone)]
pub struct Handler {
    kind: HandlerKind,
    api: String,
    ver: String,
    chain: TransformChain,
}

impl Handler {
    pub fn new(kind: HandlerKind, api: &str, ver: &str, chain: TransformChain) -> Self {
        Self {
            kind,
            api: api.to_string(),
            ver: ver.to_string(),
            chain,
        }
    }

    /// Builds the handler for a configured route, resolving its chain from `plugins`.
    pub fn from_route(route: &HandlerRoute, plugins: &PluginTable) -> Self {
        let chain = TransformChain::resolve(plugins, &route.api, &route.ver);
        debug!(
            "Route {} /{}/{} uses transforms {:?}",
            route.kind,
            route.api,
            route.ver,
            chain.names()
        );
        Self::new(route.kind, &route.api, &route.ver, chain)
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn method(&self) -> Method {
        match self.kind {
            HandlerKind::HealthCheck => Method::GET,
            _ => Method::POST,
        }
    }

    /// Health checks answer on `/<api>/<ver>` exactly, every other kind on `/<api>/<ver>/...`.
    ///
    /// A [`WILDCARD`] `api` or `ver` matches any single non-empty segment.
    pub fn matches(&self, path: &str) -> bool {
        let Some(path) = path.strip_prefix('/') else {
            return false;
        };
        let mut segments = path.splitn(3, '/');
        let (Some(api), Some(ver)) = (segments.next(), segments.next()) else {
            return false;
        };
        if !segment_matches(&self.api, api) || !segment_matches(&self.ver, ver) {
            return false;
        }
        let rest = segments.next();
        match self.kind {
            HandlerKind::HealthCheck => rest.is_none(),
            _ => rest.is_some(),
        }
    }

    /// Drain responses carry an explicit `Content-Length: 0`.
    pub fn is_drain(&self) -> bool {
        matches!(self.kind, HandlerKind::Heroku | HandlerKind::Heroku2)
    }

    /// Ingests one request body received on `path`, returning how many records were published.
    ///
    /// A framing or routing error fails the request before anything is published. Otherwise every
    /// record is attempted and the first record error, if any, is returned once all are done.
    pub async fn ingest(
        &self,
        pipeline: &Pipeline,
        path: &str,
        body: &[u8],
    ) -> Result<usize, IngestError> {
        let statsd = pipeline.statsd();
        match self.kind {
            HandlerKind::HealthCheck => {
                statsd.incr(HEARTBEAT);
                Ok(0)
            }
            HandlerKind::GenericApi => {
                statsd.incr(INPUT_MOBILE);
                let text = String::from_utf8_lossy(body);
                self.chain.apply(&text, pipeline.filters())?;
                Ok(0)
            }
            HandlerKind::GenericAmqp => {
                statsd.incr(INPUT_MOBILE);
                let text = String::from_utf8_lossy(body);
                self.publish_raw(pipeline, &raw_routing_key(path), &text)
                    .await?;
                Ok(1)
            }
            HandlerKind::MultiLine => {
                statsd.incr(INPUT_MULTILINE);
                let logs = split_logged(split_multiline(body), body)?;
                let routing_key = raw_routing_key(path);
                self.publish_all(pipeline, logs, Target::Raw(&routing_key))
                    .await
            }
            HandlerKind::Heroku => {
                statsd.incr(INPUT_HEROKU);
                statsd.incr(TRUNCATE);
                let logs = split_logged(pipeline.splitter.split(body), body)?;
                let origin = DrainOrigin::from_path(path)?;
                self.publish_all(pipeline, logs, Target::Record(&origin))
                    .await
            }
            HandlerKind::Heroku2 => {
                statsd.incr(INPUT_MULTILINE);
                let logs = split_logged(split_multiline(body), body)?;
                let origin = DrainOrigin::from_path(path)?;
                self.publish_all(pipeline, logs, Target::Record(&origin))
                    .await
            }
        }
    }

    async fn publish_all(
        &self,
        pipeline: &Pipeline,
        logs: Vec<String>,
        target: Target<'_>,
    ) -> Result<usize, IngestError> {
        let mut published = 0;
        let mut first_error = None;
        for log in &logs {
            let result = match target {
                Target::Raw(routing_key) => self.publish_raw(pipeline, routing_key, log).await,
                Target::Record(origin) => self.publish_record(pipeline, origin, log).await,
            };
            match result {
                Ok(()) => published += 1,
                Err(e) => {
                    error!("Exception occurred: {e}, while proceeding: {log:?}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }

    async fn publish_raw(
        &self,
        pipeline: &Pipeline,
        routing_key: &str,
        log: &str,
    ) -> Result<(), IngestError> {
        let message = self.chain.apply(log, pipeline.filters())?;
        pipeline
            .publisher
            .publish(message.as_bytes(), routing_key)
            .await?;
        Ok(())
    }

    async fn publish_record(
        &self,
        pipeline: &Pipeline,
        origin: &DrainOrigin,
        log: &str,
    ) -> Result<(), IngestError> {
        let record = LogRecord::new(origin, log.to_string());
        let record = record.with_message(self.chain.apply(&record.message, pipeline.filters())?);
        pipeline
            .publisher
            .publish(&record.to_json()?, &origin.routing_key())
            .await?;
        Ok(())
    }
}

fn split_logged<E>(result: Result<Vec<String>, E>, body: &[u8]) -> Result<Vec<String>, IngestError>
where
    E: Into<IngestError> + std::fmt::Display,
{
    result.map_err(|e| {
        error!(
            "Exception occurred: {e}, while proceeding: {:?}",
            String::from_utf8_lossy(body)
        );
        e.into()
    })
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    if pattern == WILDCARD {
        !segment.is_empty()
    } else {
        pattern == segment
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::amqp::{BrokerConnection, BrokerSettings, MemoryBroker, QueueSpec};
    use crate::config::Config;
    use crate::errors::{FramingError, PublishError, TransformError};
    use crate::metrics::{AMQP_OUTPUT, AMQP_OUTPUT_EXCEPTION};
    use crate::transform::Transform;
    use duplicate::duplicate_item;
    use serde_json::Value;

    const STATE_CHANGED: &str =
        "<40>1 2017-06-14T13:52:29+00:00 host app web.3 - State changed from starting to up";
    const STARTING: &str = "<40>1 2017-06-14T13:53:26+00:00 host app web.3 - Starting process \
                            with command `bundle exec rackup config.ru -p 24405`";

    struct Fixture {
        broker: MemoryBroker,
        statsd: StatsdClient,
        pipeline: Pipeline,
        config: Config,
    }

    fn fixture(config: Config) -> Fixture {
        let broker = MemoryBroker::new();
        let statsd = StatsdClient::capture("h2l");
        let settings = BrokerSettings {
            queues: vec![
                QueueSpec {
                    name: "heroku_integration_queue".to_string(),
                    binding: Some("heroku.*.integration.#".to_string()),
                },
                QueueSpec {
                    name: "mobile_integration_queue".to_string(),
                    binding: Some("mobile.*.integration.#".to_string()),
                },
            ],
            ..Default::default()
        };
        let connection = Arc::new(BrokerConnection::new(Arc::new(broker.clone()), settings));
        let publisher = Publisher::new(connection, statsd.clone(), "logs", 1);
        let pipeline = Pipeline::new(
            Splitter::new(config.filters.clone()),
            publisher,
            statsd.clone(),
        );
        Fixture {
            broker,
            statsd,
            pipeline,
            config,
        }
    }

    fn handler(config: &Config, kind: HandlerKind, api: &str, ver: &str) -> Handler {
        let route = HandlerRoute {
            kind,
            api: api.to_string(),
            ver: ver.to_string(),
        };
        Handler::from_route(&route, &config.plugins)
    }

    fn frame(records: &[&str]) -> Vec<u8> {
        records
            .iter()
            .map(|record| format!("{} {record}\n", record.len() + 1))
            .collect::<String>()
            .into_bytes()
    }

    fn queued_json(broker: &MemoryBroker, queue: &str) -> Vec<Value> {
        broker
            .queue_messages(queue)
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    #[duplicate_item(
        test_name                 kind                       input                        expected;
        [test_health_exact]       [HandlerKind::HealthCheck] ["/api/heartbeat"]           [true];
        [test_health_no_suffix]   [HandlerKind::HealthCheck] ["/api/heartbeat/x"]         [false];
        [test_heroku_prefix]      [HandlerKind::Heroku]      ["/api/heartbeat/main/app"]  [true];
        [test_heroku_needs_slash] [HandlerKind::Heroku]      ["/api/heartbeat"]           [false];
        [test_other_version]      [HandlerKind::Heroku]      ["/api/heartbeat2/main/app"] [false];
        [test_other_api]          [HandlerKind::MultiLine]   ["/apis/heartbeat/main/app"] [false];
    )]
    #[test]
    fn test_name() {
        let handler = Handler::new(kind, "api", "heartbeat", TransformChain::default());
        assert_eq!(handler.matches(input), expected);
    }

    #[duplicate_item(
        test_name                  input                       expected;
        [test_wildcard_any_ver]    ["/mobile/v1/main/app"]     [true];
        [test_wildcard_other_ver]  ["/mobile/v2/main/app"]     [true];
        [test_wildcard_empty_ver]  ["/mobile//main/app"]       [false];
        [test_wildcard_other_api]  ["/heroku/v1/main/app"]     [false];
        [test_wildcard_no_rest]    ["/mobile/v1"]              [false];
    )]
    #[test]
    fn test_name() {
        let handler = Handler::new(
            HandlerKind::GenericAmqp,
            "mobile",
            WILDCARD,
            TransformChain::default(),
        );
        assert_eq!(handler.matches(input), expected);
    }

    #[test]
    fn test_wildcard_route_from_config() {
        let config = Config::from_lookup(|name| {
            (name == "HANDLERS").then(|| "GenericAMQPHandler:mobile".to_string())
        })
        .unwrap();
        let route = &config.handlers[0];
        let handler = Handler::from_route(route, &config.plugins);

        assert!(handler.matches("/mobile/v1/main/app"));
        assert!(handler.matches("/mobile/v7/integration/app"));
    }

    #[test]
    fn test_methods_and_drain_kinds() {
        let config = Config::default();
        let health = handler(&config, HandlerKind::HealthCheck, "api", "healthcheck");
        assert_eq!(health.method(), Method::GET);
        assert!(!health.is_drain());

        let heroku = handler(&config, HandlerKind::Heroku, "heroku", "v1");
        assert_eq!(heroku.method(), Method::POST);
        assert!(heroku.is_drain());
        assert!(handler(&config, HandlerKind::Heroku2, "heroku", "v2").is_drain());
        assert!(!handler(&config, HandlerKind::MultiLine, "mobile", "v1").is_drain());
    }

    #[tokio::test]
    async fn test_heroku_two_records() {
        let f = fixture(Config::default());
        let heroku = handler(&f.config, HandlerKind::Heroku, "heroku", "v1");

        let published = heroku
            .ingest(
                &f.pipeline,
                "/heroku/v1/integration/toto",
                &frame(&[STATE_CHANGED, STARTING]),
            )
            .await
            .unwrap();

        assert_eq!(published, 2);
        let records = queued_json(&f.broker, "heroku_integration_queue");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "heroku");
        assert_eq!(records[0]["parser_ver"], "v1");
        assert_eq!(records[0]["env"], "integration");
        assert_eq!(records[0]["app"], "toto");
        assert_eq!(records[0]["message"], STATE_CHANGED);
        assert_eq!(records[0]["http_content_length"], STATE_CHANGED.len());
        assert_eq!(records[1]["message"], STARTING);
        assert!(f
            .broker
            .published()
            .iter()
            .all(|message| message.routing_key == "heroku.v1.integration.toto"));
        assert_eq!(f.statsd.count_of(INPUT_HEROKU), 1);
        assert_eq!(f.statsd.count_of(TRUNCATE), 1);
        assert_eq!(f.statsd.count_of(AMQP_OUTPUT), 2);
    }

    #[tokio::test]
    async fn test_heroku_truncates_long_record() {
        let config = Config::from_lookup(|name| {
            (name == "TRUNCATE_MAX_MSG_LENGTH").then(|| "100".to_string())
        })
        .unwrap();
        let f = fixture(config);
        let heroku = handler(&f.config, HandlerKind::Heroku, "heroku", "v1");
        let long = format!("{}{}", "a".repeat(73), "z".repeat(50));
        assert_eq!(long.len(), 123);

        heroku
            .ingest(&f.pipeline, "/heroku/v1/integration/toto", &frame(&[&long]))
            .await
            .unwrap();

        let records = queued_json(&f.broker, "heroku_integration_queue");
        assert_eq!(
            records[0]["message"],
            format!("{} __TRUNCATED__ {}", "a".repeat(50), "z".repeat(50))
        );
        // measured after the splitter truncated it
        assert_eq!(records[0]["http_content_length"], 115);
    }

    #[tokio::test]
    async fn test_heroku_redacts_tokens() {
        let f = fixture(Config::default());
        let heroku = handler(&f.config, HandlerKind::Heroku, "heroku", "v1");
        let log = r#"<40>1 2017-06-14T13:52:29+00:00 host app web.3 - {"token":"s3cr3t","id":1}"#;

        heroku
            .ingest(&f.pipeline, "/heroku/v1/integration/toto", &frame(&[log]))
            .await
            .unwrap();

        let records = queued_json(&f.broker, "heroku_integration_queue");
        let message = records[0]["message"].as_str().unwrap();
        assert!(message.ends_with(r#"{"token":"__TOKEN_REPLACED__","id":1}"#));
        assert!(!message.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_malformed_frame_publishes_nothing() {
        let f = fixture(Config::default());
        let heroku = handler(&f.config, HandlerKind::Heroku, "heroku", "v1");
        let body = format!("{} {STATE_CHANGED}\n119 {STARTING}", STATE_CHANGED.len() + 1);

        let err = heroku
            .ingest(&f.pipeline, "/heroku/v1/integration/toto", body.as_bytes())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Framing(FramingError::Truncated { declared: 119, .. })
        ));
        assert!(f.broker.published().is_empty());
        assert_eq!(f.statsd.count_of(AMQP_OUTPUT), 0);
    }

    #[tokio::test]
    async fn test_heroku_short_path() {
        let f = fixture(Config::default());
        let heroku = handler(&f.config, HandlerKind::Heroku, "heroku", "v1");

        let err = heroku
            .ingest(&f.pipeline, "/heroku/v1/integration", &frame(&[STATE_CHANGED]))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Routing(_)));
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_heroku2_multiline_records() {
        let f = fixture(Config::default());
        let heroku2 = handler(&f.config, HandlerKind::Heroku2, "heroku", "v2");
        let body = "5 hello\n  5 world\n";

        let published = heroku2
            .ingest(&f.pipeline, "/heroku/v2/integration/toto", body.as_bytes())
            .await
            .unwrap();

        assert_eq!(published, 2);
        let records = queued_json(&f.broker, "heroku_integration_queue");
        assert_eq!(records[0]["message"], "hello");
        assert_eq!(records[0]["parser_ver"], "v2");
        assert_eq!(records[1]["message"], "world");
        assert_eq!(f.statsd.count_of(INPUT_MULTILINE), 1);
        assert_eq!(f.statsd.count_of(INPUT_HEROKU), 0);
    }

    #[tokio::test]
    async fn test_multiline_publishes_raw() {
        let f = fixture(Config::default());
        let multiline = handler(&f.config, HandlerKind::MultiLine, "mobile", "v1");

        multiline
            .ingest(
                &f.pipeline,
                "/mobile/v1/integration/app",
                b"3 one 3 two",
            )
            .await
            .unwrap();

        assert_eq!(
            f.broker.queue_messages("mobile_integration_queue"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(
            f.broker.published()[0].routing_key,
            "mobile.v1.integration.app"
        );
    }

    #[tokio::test]
    async fn test_multiline_bad_length() {
        let f = fixture(Config::default());
        let multiline = handler(&f.config, HandlerKind::MultiLine, "mobile", "v1");

        let err = multiline
            .ingest(&f.pipeline, "/mobile/v1/integration/app", b"three one")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Framing(FramingError::InvalidLength { .. })
        ));
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_stop_later_records() {
        let f = fixture(Config::default());
        f.broker.fail_publishes(true);
        let multiline = handler(&f.config, HandlerKind::MultiLine, "mobile", "v1");

        let err = multiline
            .ingest(&f.pipeline, "/mobile/v1/integration/app", b"3 one 3 two")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Publish(PublishError::Transport { .. })
        ));
        assert_eq!(f.statsd.count_of(AMQP_OUTPUT), 2);
        assert_eq!(f.statsd.count_of(AMQP_OUTPUT_EXCEPTION), 2);
    }

    fn reject_odd(text: &str, _filters: &Filters) -> Result<String, TransformError> {
        if text.len() % 2 == 1 {
            return Err(TransformError {
                name: "reject_odd",
                reason: format!("{text} has an odd length"),
            });
        }
        Ok(text.to_uppercase())
    }

    #[tokio::test]
    async fn test_transform_error_drops_only_that_record() {
        let f = fixture(Config::default());
        let chain = TransformChain::new(vec![Transform::new("reject_odd", reject_odd)]);
        let multiline = Handler::new(HandlerKind::MultiLine, "mobile", "v1", chain);

        let err = multiline
            .ingest(
                &f.pipeline,
                "/mobile/v1/integration/app",
                b"3 one 4 four",
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Transform(TransformError {
                name: "reject_odd",
                ..
            })
        ));
        assert_eq!(
            f.broker.queue_messages("mobile_integration_queue"),
            vec![b"FOUR".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_generic_amqp_publishes_body() {
        let f = fixture(Config::default());
        let generic = handler(&f.config, HandlerKind::GenericAmqp, "mobile", "v1");

        let published = generic
            .ingest(
                &f.pipeline,
                "/mobile/v1/integration/app",
                br#"{"token":"abc","level":"info"}"#,
            )
            .await
            .unwrap();

        assert_eq!(published, 1);
        assert_eq!(
            f.broker.queue_messages("mobile_integration_queue"),
            vec![br#"{"token":"abc","level":"info"}"#.to_vec()]
        );
        assert_eq!(f.statsd.count_of(INPUT_MOBILE), 1);
    }

    #[tokio::test]
    async fn test_generic_api_does_not_publish() {
        let f = fixture(Config::default());
        let generic = handler(&f.config, HandlerKind::GenericApi, "mobile", "v1");

        let published = generic
            .ingest(&f.pipeline, "/mobile/v1/integration/app", b"anything")
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert!(f.broker.published().is_empty());
        assert_eq!(f.statsd.count_of(INPUT_MOBILE), 1);
    }

    #[tokio::test]
    async fn test_health_check_counts_heartbeat() {
        let f = fixture(Config::default());
        let health = handler(&f.config, HandlerKind::HealthCheck, "api", "heartbeat");

        let published = health
            .ingest(&f.pipeline, "/api/heartbeat", b"")
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert_eq!(f.statsd.count_of(HEARTBEAT), 1);
        assert_eq!(f.broker.connect_count(), 0);
    }
}
