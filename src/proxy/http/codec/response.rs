use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use super::headers::Http1HeaderLine;
use super::line::read_line_with_timeout;

/// How the response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
pub(crate) struct Http1ResponseHead {
    pub status_line: String,
    pub status: StatusCode,
    pub headers: Vec<Http1HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl Http1ResponseHead {
    pub fn body_plan(&self, method: &Method) -> BodyPlan {
        if method == Method::HEAD
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
            || self.status.is_informational()
        {
            return BodyPlan::Empty;
        }
        if self.chunked {
            return BodyPlan::Chunked;
        }
        match self.content_length {
            Some(length) => BodyPlan::Fixed(length as usize),
            None => BodyPlan::UntilClose,
        }
    }
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "upgrade",
    "transfer-encoding",
    "trailer",
    "content-length",
];

/// Encodes the head of a fully-buffered proxied response: origin headers minus
/// hop-by-hop metadata, a Content-Length pinned to the buffered body, the
/// cache marker, and an explicit Connection disposition.
pub(crate) fn encode_proxied_response_head(
    head: &Http1ResponseHead,
    body_len: usize,
    marker: (&str, &str),
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(head.status_line.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let mut connection_tokens = HashSet::new();
    for header in &head.headers {
        if header.lower_name() == "connection" {
            for token in header.value.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                connection_tokens.insert(token.to_ascii_lowercase());
            }
        }
    }

    for header in &head.headers {
        let name_lower = header.lower_name();
        if HOP_BY_HOP_HEADERS.contains(&name_lower) || connection_tokens.contains(name_lower) {
            continue;
        }
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    let (marker_name, marker_value) = marker;
    buffer.extend_from_slice(marker_name.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(marker_value.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    // 1xx and 204 responses must not carry Content-Length.
    if !(head.status == StatusCode::NO_CONTENT || head.status.is_informational()) {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body_len.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: ");
    buffer.extend_from_slice(if close { b"close" as &[u8] } else { b"keep-alive" });
    buffer.extend_from_slice(b"\r\n\r\n");
    buffer
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut consumed = 0usize;
    let mut status_line = String::new();

    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    consumed += bytes;
    let trimmed = status_line.trim_end_matches(['\r', '\n']);
    let (version, status, _) = parse_http1_status_line(trimmed)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = matches!(version, Version::HTTP_10);

    let mut header_line = String::new();
    loop {
        header_line.clear();
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            timeout_dur,
            peer,
            max_header_bytes,
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        consumed = consumed
            .checked_add(read)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
        ensure!(
            consumed <= max_header_bytes,
            "upstream response headers exceed configured limit"
        );
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            let mut saw_close = false;
            let mut saw_keep_alive = false;
            for token in value.split(',').map(|token| token.trim()) {
                if token.eq_ignore_ascii_case("close") {
                    saw_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    saw_keep_alive = true;
                }
            }
            if saw_close {
                connection_close = true;
            } else if saw_keep_alive {
                connection_close = false;
            }
        }
        headers.push(Http1HeaderLine::new(name, value));
    }

    if transfer_encoding_present && content_length_seen {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Http1ResponseHead {
        status_line: trimmed.to_string(),
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}
