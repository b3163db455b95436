//! HTTP transport in front of an OGC server
//!
//! Every OWS request waits in the flow chain before being forwarded to the
//! upstream server. Without an upstream the gateway answers admitted
//! requests itself with a small JSON document, which is handy for testing
//! rule files.
//!
//! # API Endpoints
//!
//! ## ANY /ows, /{service}, /{workspace}/{service}
//!
//! OWS dispatch. The service, operation and output format are read from the
//! KVP query parameters (`service`, `request`, `outputFormat` or `format`);
//! on a service endpoint such as `/wms` a missing `service` defaults to the
//! path. Refusals are answered with
//!
//! - `403` when the client address is blacklisted
//! - `503` when the request waited its whole timeout in a queue
//! - `429` when a rate limit rejects excess requests
//!
//! Rate controllers add `X-RateLimit-*` headers to every response, refusals
//! included.
//!
//! ## GET /status
//!
//! JSON occupancy of every controller, in chain order.
//!
//! ## GET /metrics
//!
//! Prometheus text format.
//!
//! ## GET /health
//!
//! Health check endpoint. Returns "OK" with 200 status.

use super::Transport;
use crate::metrics::Outcome;
use crate::state::{FlowState, Upstream};
use crate::types::{DispatchResponse, ErrorResponse, OwsParams, StatusResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, request::Parts};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use flowgate::{FlowError, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Largest request body forwarded upstream (WFS-T and SLD bodies included)
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// HTTP transport implementation
pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid HTTP address {host}:{port}"))?;
        Ok(Self { addr })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(self, state: Arc<FlowState>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("HTTP server listening on {}", self.addr);
        serve(listener, state).await
    }
}

/// Serve the gateway on an already bound listener
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<FlowState>) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Routes of the gateway
///
/// Handlers read the client address from [`ConnectInfo`], so the router has
/// to be served with connect info (see [`serve`]).
pub fn router(state: Arc<FlowState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .route("/ows", any(handle_ows))
        .route("/{service}", any(handle_service))
        .route("/{workspace}/{service}", any(handle_workspace_service))
        .with_state(state)
}

async fn handle_status(State(state): State<Arc<FlowState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_seconds: state.metrics().uptime_seconds(),
        timeout_secs: state.chain().timeout().as_secs(),
        controllers: state
            .chain()
            .statuses()
            .into_iter()
            .map(Into::into)
            .collect(),
    })
}

async fn handle_metrics(State(state): State<Arc<FlowState>>) -> impl IntoResponse {
    let body = state
        .metrics()
        .export_prometheus(&state.chain().statuses());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn handle_ows(
    State(state): State<Arc<FlowState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(pairs): Query<Vec<(String, String)>>,
    request: axum::extract::Request,
) -> Response {
    dispatch(state, peer, OwsParams::from_pairs(&pairs), request).await
}

async fn handle_service(
    State(state): State<Arc<FlowState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(service): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    request: axum::extract::Request,
) -> Response {
    let params = OwsParams::from_pairs(&pairs).with_default_service(&service);
    dispatch(state, peer, params, request).await
}

async fn handle_workspace_service(
    State(state): State<Arc<FlowState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((_workspace, service)): Path<(String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
    request: axum::extract::Request,
) -> Response {
    let params = OwsParams::from_pairs(&pairs).with_default_service(&service);
    dispatch(state, peer, params, request).await
}

/// Run one OWS request through the flow chain and answer it
async fn dispatch(
    state: Arc<FlowState>,
    peer: SocketAddr,
    params: OwsParams,
    request: axum::extract::Request,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let flow_request = Arc::new(flow_request(&params, peer, &parts.headers));

    let (outcome, mut response) = if state.is_blocked(&flow_request) {
        tracing::debug!(
            "Refusing blacklisted client {}",
            flow_request.remote_address().unwrap_or("unknown")
        );
        (
            Outcome::Blacklisted,
            error_response(StatusCode::FORBIDDEN, "client address is blacklisted"),
        )
    } else {
        match state.chain().admit(flow_request.clone()).await {
            Ok(admission) => {
                let response = match state.upstream() {
                    Some(upstream) => forward(&state, upstream, peer, parts, body).await,
                    None => Json(DispatchResponse {
                        admitted: true,
                        service: params.service,
                        request: params.request,
                        output_format: params.output_format,
                        controllers: admission.len(),
                    })
                    .into_response(),
                };
                // Permits are held until the upstream answer is fully read
                drop(admission);
                (Outcome::Admitted, response)
            }
            Err(err) => {
                let outcome = match err {
                    FlowError::Timeout { .. } => Outcome::TimedOut,
                    FlowError::TooManyRequests { .. } => Outcome::Rejected,
                };
                tracing::debug!("Request refused: {}", err);
                (outcome, error_response(err.status_code(), &err.to_string()))
            }
        }
    };

    for (name, value) in flow_request.response_headers().iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }

    state
        .metrics()
        .record_request(outcome, started.elapsed().as_micros() as u64);
    response
}

/// Flow control view of an inbound HTTP request
fn flow_request(params: &OwsParams, peer: SocketAddr, headers: &HeaderMap) -> Request {
    let mut builder = Request::builder()
        .remote_ip(peer.ip())
        .headers(headers.clone());
    if let Some(service) = &params.service {
        builder = builder.service(service);
    }
    if let Some(operation) = &params.request {
        builder = builder.operation(operation);
    }
    if let Some(format) = &params.output_format {
        builder = builder.output_format(format);
    }
    builder.build()
}

/// Forward an admitted request and buffer the upstream answer
async fn forward(
    state: &FlowState,
    upstream: &Upstream,
    peer: SocketAddr,
    parts: Parts,
    body: Body,
) -> Response {
    match try_forward(upstream, peer, parts, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Upstream request failed: {:#}", e);
            state.metrics().record_upstream_error();
            error_response(StatusCode::BAD_GATEWAY, "upstream server unavailable")
        }
    }
}

async fn try_forward(
    upstream: &Upstream,
    peer: SocketAddr,
    parts: Parts,
    body: Body,
) -> Result<Response> {
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .context("Failed to read request body")?;

    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", upstream.base_url, path);

    let mut headers = without_hop_by_hop(&parts.headers);
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.append(flowgate::request::X_FORWARDED_FOR, value);
    }

    let answer = upstream
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;

    let status = answer.status();
    let headers = without_hop_by_hop(answer.headers());
    let bytes: Bytes = answer
        .bytes()
        .await
        .with_context(|| format!("Failed to read answer from {url}"))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn without_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = headers.clone();
    for name in &HOP_BY_HOP {
        filtered.remove(name);
    }
    filtered
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
