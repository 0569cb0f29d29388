//! Stitchway - remote schema federation gateway.
//!
//! # Usage
//!
//! ```bash
//! # Federate two services
//! APIS=http://users:4001/graphql,http://orders:4002/graphql stitchway
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use stitchway::metrics::init_metrics;
use stitchway::{
    FederatedQueryPlanner, FederationGateway, FetchExecutor, GatewayConfig, GatewayError,
    GraphQLRequest, GraphQLResponse, HttpTransport, IntrospectionSchemaRegistry, Plugin,
};

type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

fn respond_json(status: StatusCode, body: &impl serde::Serialize) -> HttpResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(status, "application/json", bytes),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            internal_server_error()
        }
    }
}

// Create a standard internal server error response
fn internal_server_error() -> HttpResponse {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::PartialFailure { .. } => StatusCode::OK,
        GatewayError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        GatewayError::UpstreamFailed { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::NoSchema | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<HttpResponse, Infallible> {
    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(respond(
                        StatusCode::BAD_REQUEST,
                        "text/plain",
                        "Failed to read request body",
                    ));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(graphql_req) => match gateway.process_request(graphql_req).await {
                    Ok(response) => respond_json(StatusCode::OK, &response),
                    Err(e) => respond_json(status_for(&e), &GraphQLResponse::from_error(&e)),
                },
                Err(e) => {
                    let error = GatewayError::ValidationFailed(format!("Invalid JSON request: {}", e));
                    respond_json(StatusCode::BAD_REQUEST, &GraphQLResponse::from_error(&error))
                }
            }
        }

        (&Method::GET, "/schema") => match gateway.schema().await {
            Some(schema) => respond(StatusCode::OK, "text/plain; charset=utf-8", schema.to_sdl()),
            None => respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "No merged schema is available",
            ),
        },

        (&Method::OPTIONS, _) => Response::builder()
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(result)
}

async fn handle_health(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<HttpResponse, Infallible> {
    let (ok, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/live") => (true, json!({ "status": "live" })),
        (&Method::GET, "/ready") => {
            let ready = gateway.is_ready();
            let status = if ready { "ready" } else { "not_ready" };
            (ready, json!({ "status": status }))
        }
        (&Method::GET, "/health") => {
            let healthy = gateway.is_healthy();
            let status = if healthy { "healthy" } else { "shutting_down" };
            let upstreams: Map<String, Value> = gateway
                .statuses()
                .await
                .into_iter()
                .map(|(name, status)| (name, json!(status.to_string())))
                .collect();
            (
                healthy,
                json!({
                    "status": status,
                    "upstreams": upstreams,
                }),
            )
        }
        _ => return Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    };

    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    Ok(respond_json(status, &body))
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

/// Accepts connections until `shutdown` flips to true.
async fn serve<H, Fut>(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) where
    H: Fn(Request<Incoming>, Arc<FederationGateway>) -> Fut + Copy + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, Infallible>> + Send + 'static,
{
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handler(req, Arc::clone(&gateway)));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "Error processing connection");
            }
        });
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn init_metrics_exporter(port: u16) {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            init_metrics();
            info!(%addr, "Metrics exporter listening");
        }
        Err(e) => warn!(error = %e, "Failed to start metrics exporter, continuing without metrics"),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = GatewayConfig::parse();
    init_tracing(&config.log_level, config.json_logs);

    let options = config
        .server_options()
        .context("Invalid gateway configuration")?;

    if options.has_plugin(Plugin::Metrics) {
        init_metrics_exporter(config.metrics_port);
    }

    let transport =
        HttpTransport::new(options.upstream_timeout).context("Failed to build HTTP client")?;
    let registry = IntrospectionSchemaRegistry::new(options.upstreams.clone(), Arc::new(transport));
    let executor = FetchExecutor::new(options.upstream_timeout).with_tracing(options.engine_tracing);

    let gateway = Arc::new(FederationGateway::new(
        Box::new(registry),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(executor),
    ));

    info!(upstreams = options.upstreams.len(), "Starting federation gateway");
    match gateway.refresh().await {
        Ok(report) => info!(
            healthy = report.healthy.len(),
            degraded = report.degraded.len(),
            "Initial schema merged"
        ),
        Err(e) => warn!(error = %e, "Initial schema merge failed, serving without a schema"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Health stays up while requests drain.
    let (health_tx, health_rx) = watch::channel(false);

    let refresh_handle = config
        .refresh_interval()
        .map(|interval| gateway.spawn_refresh_task(interval, shutdown_rx.clone()));

    let health_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.health_port));
    let health_listener = TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health port {}", health_addr))?;
    let health_handle = tokio::spawn(serve(
        health_listener,
        Arc::clone(&gateway),
        handle_health,
        health_rx,
    ));

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind port {}", addr))?;
    let server_handle = tokio::spawn(serve(
        listener,
        Arc::clone(&gateway),
        handle_request,
        shutdown_rx,
    ));
    info!(%addr, %health_addr, "GraphQL endpoint ready at http://{}/graphql", addr);

    shutdown_signal().await;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = server_handle.await {
        warn!(error = %e, "Server task ended abnormally");
    }
    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }

    let drained = gateway.shutdown(config.shutdown_grace()).await;
    if !drained {
        warn!(in_flight = gateway.in_flight(), "Exiting with requests still in flight");
    }
    let _ = health_tx.send(true);
    let _ = health_handle.await;
    info!("Gateway stopped");
    Ok(())
}
