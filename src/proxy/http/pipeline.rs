use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::cache::{MARKER_HEADER, MARKER_HIT, MARKER_MISS, StoreOutcome};
use crate::proxy::forward_error::{
    classify_forward_error, forward_error_reason, forward_error_status, log_forward_error,
};
use crate::util::timeout_with_context;

use super::codec::{
    BodyTooLarge, Http1HeaderLine, Http1RequestHead, encode_proxied_response_head,
    read_chunked_body, read_fixed_body, read_http1_request_head,
};
use super::respond::send_error_response;

enum ClientDisposition {
    Continue,
    Close,
}

/// Drives one client connection: requests are handled sequentially until the
/// client goes away, asks to close, or an error leaves the stream in an
/// unknown state.
pub(crate) async fn serve_connection(
    app: &AppContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut reader = BufReader::new(stream);
    loop {
        match handle_one_request(app, &mut reader, peer).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }
    Ok(())
}

async fn handle_one_request(
    app: &AppContext,
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
) -> Result<ClientDisposition> {
    let timeout = app.settings.client_read_timeout();

    let head = match read_http1_request_head(
        reader,
        peer,
        timeout,
        timeout,
        app.settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(ClientDisposition::Close),
        Err(err) => {
            debug!(peer = %peer, error = %err, "rejecting malformed request");
            send_error_response(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                &err.to_string(),
                timeout,
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let start = Instant::now();
    let Some(host) = head.headers.host().map(str::to_string) else {
        send_error_response(
            reader.get_mut(),
            StatusCode::BAD_REQUEST,
            "missing Host header",
            timeout,
        )
        .await?;
        return Ok(ClientDisposition::Close);
    };

    match head.headers.expect_continue() {
        Ok(false) => {}
        Ok(true) => {
            timeout_with_context(
                timeout,
                reader.get_mut().write_all(b"HTTP/1.1 100 Continue\r\n\r\n"),
                "writing 100 Continue to client",
            )
            .await?;
        }
        Err(err) => {
            send_error_response(
                reader.get_mut(),
                StatusCode::EXPECTATION_FAILED,
                &err.to_string(),
                timeout,
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    }

    let should_close = head.headers.wants_connection_close();

    // The body is consumed up front so a cache hit leaves the connection
    // aligned on the next request.
    let request_body = match read_request_body(app, reader, peer, &head).await {
        Ok(body) => body,
        Err(err) => {
            let status = if err.downcast_ref::<BodyTooLarge>().is_some() {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            debug!(peer = %peer, error = %err, "failed to read request body");
            send_error_response(reader.get_mut(), status, &err.to_string(), timeout).await?;
            return Ok(ClientDisposition::Close);
        }
    };

    // Request path: the cache is consulted before anything is forwarded.
    if let Some(hit) = app.cache.lookup(&head.method, &host, &head.target).await {
        let copied = write_cached_response(reader.get_mut(), app, &hit, should_close).await?;
        AccessLogBuilder::new(peer)
            .method(head.method.as_str())
            .host(&host)
            .path(&head.target)
            .status(StatusCode::OK)
            .cache_lookup("hit")
            .cache_store("bypassed")
            .bytes(request_bytes(&head, &request_body), copied)
            .elapsed(start.elapsed())
            .log();
        return Ok(if should_close {
            ClientDisposition::Close
        } else {
            ClientDisposition::Continue
        });
    }

    let forward_headers: Vec<Http1HeaderLine> = head.headers.forward_headers().cloned().collect();
    let forward_path = app.route.rewrite_path(&head.target);
    let host_header = if app.route.change_origin {
        app.upstream.target().host_header().to_string()
    } else {
        host.clone()
    };

    let response = match app
        .upstream
        .exchange(
            &head.method,
            &forward_path,
            &host_header,
            &forward_headers,
            request_body.as_deref(),
        )
        .await
    {
        Ok(response) => response,
        Err(err) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, peer, &host, &err);
            let status = forward_error_status(&kind);
            let reason = forward_error_reason(&kind);
            send_error_response(reader.get_mut(), status, reason, timeout).await?;
            AccessLogBuilder::new(peer)
                .method(head.method.as_str())
                .host(&host)
                .path(&head.target)
                .status(status)
                .cache_lookup("miss")
                .bytes(request_bytes(&head, &request_body), 0)
                .elapsed(start.elapsed())
                .error_reason(reason)
                .error_detail(err.to_string())
                .log();
            return Ok(ClientDisposition::Close);
        }
    };

    // Response path: deliver first, then populate the cache. A failed store
    // must never take down a response that already reached the client.
    let declared_len = if head.method == Method::HEAD {
        response.head.content_length.unwrap_or(0) as usize
    } else {
        response.body.len()
    };
    let encoded_head = encode_proxied_response_head(
        &response.head,
        declared_len,
        (MARKER_HEADER, MARKER_MISS),
        should_close,
    );
    timeout_with_context(
        timeout,
        async {
            let stream = reader.get_mut();
            stream.write_all(&encoded_head).await?;
            if head.method != Method::HEAD && !response.body.is_empty() {
                stream.write_all(&response.body).await?;
            }
            stream.flush().await
        },
        "writing proxied response to client",
    )
    .await?;

    let cache_store = match app
        .cache
        .store(
            &head.method,
            &host,
            &head.target,
            response.head.status,
            &super::codec::header_lines_to_map(response.head.headers.iter()),
            &response.body,
        )
        .await
    {
        Ok(StoreOutcome::Stored) => "stored",
        Ok(StoreOutcome::Skipped) => "skipped",
        Err(err) => {
            warn!(
                peer = %peer,
                host = %host,
                error = %err,
                "cache store failed, response already delivered"
            );
            "failed"
        }
    };

    AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .host(&host)
        .path(&head.target)
        .status(response.head.status)
        .cache_lookup("miss")
        .cache_store(cache_store)
        .bytes(request_bytes(&head, &request_body), response.body.len() as u64)
        .elapsed(start.elapsed())
        .log();

    Ok(if should_close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    })
}

async fn write_cached_response(
    stream: &mut TcpStream,
    app: &AppContext,
    hit: &crate::proxy::cache::CachedResponse,
    close: bool,
) -> Result<u64> {
    let timeout = app.settings.client_read_timeout();

    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    for (name, value) in hit.pass_through_headers() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(MARKER_HEADER);
    head.push_str(": ");
    head.push_str(MARKER_HIT);
    head.push_str("\r\nContent-Length: ");
    head.push_str(&hit.body.len().to_string());
    head.push_str("\r\nConnection: ");
    head.push_str(if close { "close" } else { "keep-alive" });
    head.push_str("\r\n\r\n");

    timeout_with_context(
        timeout,
        async {
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&hit.body).await?;
            stream.flush().await
        },
        "writing cached response to client",
    )
    .await?;
    Ok(hit.body.len() as u64)
}

async fn read_request_body(
    app: &AppContext,
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    head: &Http1RequestHead,
) -> Result<Option<Bytes>> {
    let timeout = app.settings.client_read_timeout();
    let limit = app.settings.max_request_body_size;
    if head.headers.is_chunked() {
        let body = read_chunked_body(reader, limit, timeout, peer).await?;
        return Ok(Some(body));
    }
    match head.headers.content_length() {
        Some(0) => Ok(Some(Bytes::new())),
        Some(length) => {
            let body = read_fixed_body(
                reader,
                length,
                limit,
                timeout,
                "reading request body from client",
            )
            .await?;
            Ok(Some(body))
        }
        None => Ok(None),
    }
}

fn request_bytes(head: &Http1RequestHead, body: &Option<Bytes>) -> u64 {
    head.total_request_bytes() + body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
}
