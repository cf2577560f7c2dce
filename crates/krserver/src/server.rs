//
// server.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! The HTTP front end: a small REST API for kernels plus the websocket
//! endpoint that hands connections to a relay.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hyper::header::{
    HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    UPGRADE,
};
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::connection_registry::ConnectionRegistry;
use crate::error::KRError;
use crate::kernel_relay::KernelRelay;
use crate::supervisor::KernelSupervisor;

/// Everything a request handler needs.
pub struct ServerState {
    pub supervisor: Arc<dyn KernelSupervisor>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay_config: RelayConfig,

    /// The token clients must present, or `None` to accept everyone
    pub token: Option<String>,

    pub started: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        supervisor: Arc<dyn KernelSupervisor>,
        relay_config: RelayConfig,
        token: Option<String>,
    ) -> Self {
        Self {
            supervisor,
            registry: Arc::new(ConnectionRegistry::new()),
            relay_config,
            token,
            started: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    version: &'static str,
    #[serde(with = "krshared::iso_date")]
    started: Option<DateTime<Utc>>,
    kernels: usize,
    connections: usize,
}

#[derive(Debug, Default, Deserialize)]
struct StartKernelRequest {
    name: Option<String>,
}

#[derive(Clone)]
pub struct KernelService {
    state: Arc<ServerState>,
}

impl KernelService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl hyper::service::Service<Request<Body>> for KernelService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move { Ok(handle_request(state, request).await) })
    }
}

/// Creates a [`KernelService`] for each incoming connection.
pub struct MakeKernelService {
    state: Arc<ServerState>,
}

impl MakeKernelService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl<Target> hyper::service::Service<Target> for MakeKernelService {
    type Response = KernelService;
    type Error = Infallible;
    type Future = futures::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _target: Target) -> Self::Future {
        futures::future::ready(Ok(KernelService::new(self.state.clone())))
    }
}

/// Serve HTTP on `addr` until `shutdown` resolves.
pub async fn serve<F>(
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    F: Future<Output = ()>,
{
    let server = hyper::Server::try_bind(&addr)?.serve(MakeKernelService::new(state));
    log::info!("Listening on http://{}", server.local_addr());
    server.with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Route one request.
pub async fn handle_request(state: Arc<ServerState>, request: Request<Body>) -> Response<Body> {
    if let Err(err) = authorize(state.token.as_deref(), &request) {
        log::warn!(
            "Rejecting {} {}: {}",
            request.method(),
            request.uri().path(),
            err
        );
        return error_response(&err);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if method == Method::GET {
        if let Some(kernel_id) = extract_kernel_id_from_channels_path(&path) {
            return channels_websocket_request(state, request, kernel_id);
        }
    }

    let segments: Vec<String> = path
        .trim_matches('/')
        .split('/')
        .map(percent_decode)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let supervisor = state.supervisor.clone();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "status"]) => Ok(json_response(
            StatusCode::OK,
            &ServerStatus {
                version: env!("CARGO_PKG_VERSION"),
                started: Some(state.started),
                kernels: supervisor.list_kernels().len(),
                connections: state.registry.len(),
            },
        )),
        (&Method::GET, ["api", "kernels"]) => {
            let models: Vec<_> = supervisor
                .list_kernels()
                .iter()
                .map(|kernel| kernel.to_model())
                .collect();
            Ok(json_response(StatusCode::OK, &models))
        }
        (&Method::POST, ["api", "kernels"]) => match read_start_request(request).await {
            Ok(body) => supervisor
                .start_kernel(body.name.as_deref())
                .await
                .map(|model| json_response(StatusCode::CREATED, &model)),
            Err(err) => Err(err),
        },
        (&Method::GET, ["api", "kernels", kernel_id]) => supervisor
            .get_kernel(kernel_id)
            .map(|kernel| json_response(StatusCode::OK, &kernel.to_model()))
            .ok_or_else(|| KRError::KernelNotFound(kernel_id.to_string())),
        (&Method::DELETE, ["api", "kernels", kernel_id]) => {
            state.registry.close_kernel_connections(kernel_id);
            supervisor
                .shutdown_kernel(kernel_id)
                .await
                .map(|_| empty_response(StatusCode::NO_CONTENT))
        }
        (&Method::POST, ["api", "kernels", kernel_id, "restart"]) => supervisor
            .restart_kernel(kernel_id)
            .await
            .map(|model| json_response(StatusCode::OK, &model)),
        (&Method::POST, ["api", "kernels", kernel_id, "interrupt"]) => supervisor
            .interrupt_kernel(kernel_id)
            .await
            .map(|_| empty_response(StatusCode::NO_CONTENT)),
        _ => Ok(empty_response(StatusCode::NOT_FOUND)),
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            err.log();
            error_response(&err)
        }
    }
}

/// Check the request's token, if the server requires one. The token may be
/// given as `Authorization: token <t>`, `Authorization: Bearer <t>`, or a
/// `token` query parameter.
pub fn authorize(token: Option<&str>, request: &Request<Body>) -> Result<(), KRError> {
    let Some(expected) = token else {
        return Ok(());
    };
    let from_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("token ")
                .or_else(|| value.strip_prefix("Bearer "))
        })
        .map(str::trim);
    if from_header == Some(expected) {
        return Ok(());
    }
    if query_param(request.uri(), "token").as_deref() == Some(expected) {
        return Ok(());
    }
    Err(KRError::Unauthorized)
}

fn channels_websocket_request(
    state: Arc<ServerState>,
    mut request: Request<Body>,
    kernel_id: String,
) -> Response<Body> {
    if state.supervisor.get_kernel(&kernel_id).is_none() {
        return error_response(&KRError::KernelNotFound(kernel_id));
    }
    let accept = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .and_then(|derived| HeaderValue::from_str(&derived).ok());
    let Some(accept) = accept else {
        return error_response(&KRError::BadRequest(String::from(
            "Websocket request without a valid Sec-WebSocket-Key",
        )));
    };

    let session_id = query_param(request.uri(), "session_id")
        .filter(|session_id| !session_id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let version = request.version();
    let relay = KernelRelay::new(
        kernel_id,
        session_id,
        state.supervisor.clone(),
        state.registry.clone(),
        state.relay_config.clone(),
    );

    tokio::task::spawn(async move {
        match hyper::upgrade::on(&mut request).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                relay.serve(ws).await;
            }
            Err(e) => {
                log::error!("Failed to upgrade channel connection to websocket: {}", e);
            }
        }
    });

    let mut response = Response::new(Body::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.version_mut() = version;
    response
        .headers_mut()
        .append(CONNECTION, HeaderValue::from_static("Upgrade"));
    response
        .headers_mut()
        .append(UPGRADE, HeaderValue::from_static("websocket"));
    response.headers_mut().append(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

async fn read_start_request(request: Request<Body>) -> Result<StartKernelRequest, KRError> {
    let body = hyper::body::to_bytes(request.into_body())
        .await
        .map_err(|err| KRError::BadRequest(format!("Failed to read body: {}", err)))?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartKernelRequest::default());
    }
    serde_json::from_slice(&body)
        .map_err(|err| KRError::BadRequest(format!("Invalid kernel start request: {}", err)))
}

/// Match `/api/kernels/<id>/channels` and return the decoded kernel ID.
fn extract_kernel_id_from_channels_path(path: &str) -> Option<String> {
    static CHANNELS_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = CHANNELS_REGEX.get_or_init(|| {
        Regex::new(r"^/api/kernels/([^/?#]+)/channels/?$").expect("Invalid regex")
    });
    regex
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| percent_decode(m.as_str()))
}

fn percent_decode(segment: &str) -> String {
    percent_encoding::percent_decode(segment.as_bytes())
        .decode_utf8_lossy()
        .to_string()
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            log::error!("Failed to serialize response: {}", err);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn error_response(err: &KRError) -> Response<Body> {
    json_response(err.status_code(), &err.to_json(None))
}
