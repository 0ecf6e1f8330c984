use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::proxy::http::codec::BodyTooLarge;
use crate::util::TimedOut;

#[derive(Debug, Error)]
#[error("failed to connect to origin {host}:{port}")]
pub struct UpstreamConnectError {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
#[error("origin response exceeds configured limit")]
pub struct ResponseTooLarge {
    pub bytes_read: u64,
}

/// Normalized classification of forwarding failures so the pipeline maps them
/// to gateway responses consistently.
pub enum ForwardErrorKind<'a> {
    RequestTooLarge(&'a BodyTooLarge),
    ResponseTooLarge(&'a ResponseTooLarge),
    Connect(&'a UpstreamConnectError),
    Timeout,
    Other,
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    if let Some(body) = err.downcast_ref::<BodyTooLarge>() {
        ForwardErrorKind::RequestTooLarge(body)
    } else if let Some(response) = err.downcast_ref::<ResponseTooLarge>() {
        ForwardErrorKind::ResponseTooLarge(response)
    } else if let Some(connect) = err.downcast_ref::<UpstreamConnectError>() {
        ForwardErrorKind::Connect(connect)
    } else if err.downcast_ref::<TimedOut>().is_some() {
        ForwardErrorKind::Timeout
    } else {
        ForwardErrorKind::Other
    }
}

pub fn forward_error_status(kind: &ForwardErrorKind<'_>) -> StatusCode {
    match kind {
        ForwardErrorKind::RequestTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        ForwardErrorKind::ResponseTooLarge(_) => StatusCode::BAD_GATEWAY,
        ForwardErrorKind::Connect(_) => StatusCode::BAD_GATEWAY,
        ForwardErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ForwardErrorKind::Other => StatusCode::BAD_GATEWAY,
    }
}

pub fn forward_error_reason(kind: &ForwardErrorKind<'_>) -> &'static str {
    match kind {
        ForwardErrorKind::RequestTooLarge(_) => "request body exceeds configured limit",
        ForwardErrorKind::ResponseTooLarge(_) => "origin response exceeds configured limit",
        ForwardErrorKind::Connect(_) => "failed to reach origin",
        ForwardErrorKind::Timeout => "origin timed out",
        ForwardErrorKind::Other => "upstream exchange failed",
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, host: &str, err: &Error) {
    match kind {
        ForwardErrorKind::RequestTooLarge(body) => warn!(
            peer = %peer,
            host,
            bytes_read = body.bytes_read,
            "request body exceeded configured limit"
        ),
        ForwardErrorKind::ResponseTooLarge(response) => warn!(
            peer = %peer,
            host,
            bytes_read = response.bytes_read,
            "origin response exceeded configured limit"
        ),
        ForwardErrorKind::Connect(connect) => warn!(
            peer = %peer,
            host,
            origin = format!("{}:{}", connect.host, connect.port),
            error = %err,
            "failed to connect to origin"
        ),
        ForwardErrorKind::Timeout => warn!(
            peer = %peer,
            host,
            error = %err,
            "origin exchange timed out"
        ),
        ForwardErrorKind::Other => warn!(
            peer = %peer,
            host,
            error = %err,
            "upstream exchange failed"
        ),
    }
}
