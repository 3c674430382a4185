// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::handlers::{Handler, Pipeline};
use crate::http_utils::{
    log_and_create_http_response, verify_request_content_length, with_zero_content_length,
    HttpResponse,
};
use crate::metrics::StatsdClient;
use crate::publisher::Publisher;
use crate::splitter::Splitter;

/// How long open connections may keep running once shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Routes HTTP requests to the configured handlers.
#[derive(Debug)]
pub struct Relay {
    config: Arc<Config>,
    handlers: Vec<Handler>,
    pipeline: Pipeline,
}

impl Relay {
    pub fn new(config: Arc<Config>, publisher: Publisher, statsd: StatsdClient) -> Self {
        let handlers = config
            .handlers
            .iter()
            .map(|route| Handler::from_route(route, &config.plugins))
            .collect();
        let pipeline = Pipeline::new(Splitter::new(config.filters.clone()), publisher, statsd);
        Self {
            config,
            handlers,
            pipeline,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        let routes: Vec<&Handler> = self
            .handlers
            .iter()
            .filter(|handler| handler.matches(&path))
            .collect();
        if routes.is_empty() {
            return log_and_create_http_response(
                &format!("No route for {path}"),
                StatusCode::NOT_FOUND,
            );
        }
        let Some(handler) = routes
            .iter()
            .copied()
            .find(|handler| handler.method() == req.method())
        else {
            return log_and_create_http_response(
                &format!("Method {} not allowed on {path}", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            );
        };

        let response = self.dispatch(handler, &path, req).await;
        if handler.is_drain() {
            response.map(with_zero_content_length)
        } else {
            response
        }
    }

    async fn dispatch<B>(
        &self,
        handler: &Handler,
        path: &str,
        req: Request<B>,
    ) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let max_content_length = self.config.max_request_content_length;
        let body = if parts.method == Method::POST {
            if let Some(response) = verify_request_content_length(
                &parts.headers,
                max_content_length,
                "Error processing log payload",
            ) {
                return response;
            }
            // chunked bodies carry no length header, the limit applies while reading
            match Limited::new(body, max_content_length).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.is::<LengthLimitError>() => {
                    return log_and_create_http_response(
                        "Error processing log payload: Payload too large",
                        StatusCode::PAYLOAD_TOO_LARGE,
                    );
                }
                Err(e) => {
                    return log_and_create_http_response(
                        &format!("Error reading request body on {path}: {e}"),
                        StatusCode::BAD_REQUEST,
                    );
                }
            }
        } else {
            Default::default()
        };

        match handler.ingest(&self.pipeline, path, &body).await {
            Ok(published) => log_and_create_http_response(
                &format!("{} processed {path}, {published} record(s) published", handler.kind()),
                StatusCode::OK,
            ),
            Err(e) => log_and_create_http_response(
                &format!("Error processing request on {path}: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }
}

/// Accepts HTTP/1 connections on `listener` until `shutdown` is cancelled.
///
/// Connections still open at that point get [`SHUTDOWN_GRACE`] to finish before they are dropped.
pub async fn serve(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let relay = Arc::clone(&relay);
        async move { relay.handle(req).await }
    });

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    if let Ok(addr) = listener.local_addr() {
        info!("Listening for log drains on {addr}");
    }

    loop {
        let conn = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
            () = shutdown.cancelled() => break,
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                error!("Connection error: {e}");
            }
        });
    }

    debug!("Shutting down, {} connection(s) still open", joinset.len());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while joinset.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("Dropping {} connection(s) after shutdown grace", joinset.len());
        joinset.abort_all();
    }
    Ok(())
}
