//! HTTP surface over the renewal orchestrator.
//!
//! `GET /certificates/{name}`, `GET /certificates/{name}/status` and
//! `POST /certificates/{name}?force=bool`.

use std::{borrow::Cow, convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::errors::CertError;
use crate::renewal::CertificateRenewalOrchestrator;

type ApiResponse = Response<Full<Bytes>>;

/// Serves the API on `addr` until `shutdown` fires.
pub async fn run_api_server(
    addr: SocketAddr,
    orchestrator: Arc<CertificateRenewalOrchestrator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    info!("[api] listening on http://{addr}");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("[api] shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("[api] accept error: {err}");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                handle_request(req, Arc::clone(&orchestrator), cancel.clone())
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!("[api] error serving {peer}: {err}");
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    orchestrator: Arc<CertificateRenewalOrchestrator>,
    cancel: CancellationToken,
) -> Result<ApiResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    Ok(dispatch(&orchestrator, &method, &path, query.as_deref(), &cancel).await)
}

enum Route<'a> {
    Certificate(&'a str),
    Status(&'a str),
}

fn route(path: &str) -> Option<Route<'_>> {
    let rest = path.strip_prefix("/certificates/")?;
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        [name] => Some(Route::Certificate(*name)),
        [name, "status"] => Some(Route::Status(*name)),
        _ => None,
    }
}

/// Percent-decoded certificate name from a path segment.
fn decode_name(raw: &str) -> Result<Cow<'_, str>, CertError> {
    urlencoding::decode(raw)
        .map_err(|_| CertError::InvalidArgument(format!("certificate name '{raw}' is not valid UTF-8")))
}

/// Routes one request to the orchestrator and renders the outcome.
pub async fn dispatch(
    orchestrator: &CertificateRenewalOrchestrator,
    method: &Method,
    path: &str,
    query: Option<&str>,
    cancel: &CancellationToken,
) -> ApiResponse {
    let outcome = match (method, route(path)) {
        (&Method::GET, Some(Route::Certificate(name))) => get(orchestrator, name).await,
        (&Method::GET, Some(Route::Status(name))) => status(orchestrator, name).await,
        (&Method::POST, Some(Route::Certificate(name))) => {
            renew(orchestrator, name, query, cancel).await
        }
        (_, Some(_)) => return message(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        (_, None) => return message(StatusCode::NOT_FOUND, "not found"),
    };

    outcome.unwrap_or_else(|err| error_response(method, path, &err))
}

async fn get(
    orchestrator: &CertificateRenewalOrchestrator,
    raw_name: &str,
) -> Result<ApiResponse, CertError> {
    let name = decode_name(raw_name)?;
    let record = orchestrator.get_certificate(&name).await?;
    Ok(json(StatusCode::OK, &record))
}

async fn status(
    orchestrator: &CertificateRenewalOrchestrator,
    raw_name: &str,
) -> Result<ApiResponse, CertError> {
    let name = decode_name(raw_name)?;
    let status = orchestrator.check_status(&name).await?;
    let code = if status.expiring {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    Ok(json(code, &status.record))
}

async fn renew(
    orchestrator: &CertificateRenewalOrchestrator,
    raw_name: &str,
    query: Option<&str>,
    cancel: &CancellationToken,
) -> Result<ApiResponse, CertError> {
    let name = decode_name(raw_name)?;
    let force = parse_force(query)?;
    Ok(match orchestrator.renew(&name, force, cancel).await? {
        Some(record) => json(StatusCode::OK, &record),
        None => empty(StatusCode::NO_CONTENT),
    })
}

/// `force` from the query string; absent means false.
fn parse_force(query: Option<&str>) -> Result<bool, CertError> {
    let Some(query) = query else {
        return Ok(false);
    };
    let value = query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == "force")
        .map(|(_, value)| value);
    let Some(raw) = value else {
        return Ok(false);
    };
    let decoded = urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw));
    match decoded.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CertError::InvalidArgument(format!(
            "force must be true or false, got '{other}'"
        ))),
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn error_response(method: &Method, path: &str, err: &CertError) -> ApiResponse {
    let status = err.status_code();
    if status.is_server_error() {
        error!("[api] {method} {path} failed: {err}");
        message(status, status.canonical_reason().unwrap_or("server error"))
    } else {
        warn!("[api] {method} {path} rejected: {err}");
        message(status, &err.to_string())
    }
}

fn message(status: StatusCode, text: &str) -> ApiResponse {
    json(status, &ErrorBody { error: text })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            error!("[api] failed to serialize response: {err}");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty(status: StatusCode) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
