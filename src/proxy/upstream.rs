use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http::Method;
use rustls::pki_types::ServerName;
use rustls::{RootCertStore, client::ClientConfig, crypto::ring};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{ProxyTarget, Scheme};
use crate::proxy::forward_error::{ResponseTooLarge, UpstreamConnectError};
use crate::proxy::http::codec::{
    BodyPlan, BodyTooLarge, Http1HeaderLine, Http1ResponseHead, read_chunked_body,
    read_fixed_body, read_http1_response_head, read_until_close,
};
use crate::util::{TimedOut, timeout_with_context};

#[derive(Debug)]
pub(crate) struct UpstreamResponse {
    pub head: Http1ResponseHead,
    pub body: Bytes,
}

/// Per-request origin client. Each exchange opens a fresh connection and asks
/// the origin to close it afterwards; there is no pooling in this design.
pub(crate) struct UpstreamClient {
    target: ProxyTarget,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_response_header_size: usize,
    max_response_body_size: usize,
}

impl UpstreamClient {
    pub(crate) fn new(
        target: ProxyTarget,
        connect_timeout: Duration,
        read_timeout: Duration,
        max_response_header_size: usize,
        max_response_body_size: usize,
    ) -> Result<Self> {
        let tls = match target.scheme {
            Scheme::Http => None,
            Scheme::Https => Some(TlsConnector::from(Arc::new(build_tls_client_config()?))),
        };
        Ok(Self {
            target,
            tls,
            connect_timeout,
            read_timeout,
            max_response_header_size,
            max_response_body_size,
        })
    }

    pub(crate) fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Sends one request and reads the origin response to completion. The
    /// body is fully buffered; framing is normalized away by the caller when
    /// the response is re-encoded for the client.
    pub(crate) async fn exchange(
        &self,
        method: &Method,
        path_and_query: &str,
        host_header: &str,
        forward_headers: &[Http1HeaderLine],
        body: Option<&[u8]>,
    ) -> Result<UpstreamResponse> {
        let mut stream = self.connect().await?;

        let head = encode_upstream_request_head(
            method,
            path_and_query,
            host_header,
            forward_headers,
            body,
        );
        timeout_with_context(
            self.read_timeout,
            stream.write_all(&head),
            "writing request head to origin",
        )
        .await?;
        if let Some(body) = body
            && !body.is_empty()
        {
            timeout_with_context(
                self.read_timeout,
                stream.write_all(body),
                "writing request body to origin",
            )
            .await?;
        }
        timeout_with_context(
            self.read_timeout,
            stream.flush(),
            "flushing request to origin",
        )
        .await?;

        let origin_addr: SocketAddr = format!("{}:{}", self.target.host, self.target.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.target.port)));
        let mut reader = BufReader::new(stream);
        let head = read_http1_response_head(
            &mut reader,
            self.read_timeout,
            origin_addr,
            self.max_response_header_size,
        )
        .await?;

        let body = match head.body_plan(method) {
            BodyPlan::Empty => Bytes::new(),
            BodyPlan::Fixed(length) => read_fixed_body(
                &mut reader,
                length,
                self.max_response_body_size,
                self.read_timeout,
                "reading origin response body",
            )
            .await
            .map_err(mark_response_too_large)?,
            BodyPlan::Chunked => read_chunked_body(
                &mut reader,
                self.max_response_body_size,
                self.read_timeout,
                origin_addr,
            )
            .await
            .map_err(mark_response_too_large)?,
            BodyPlan::UntilClose => read_until_close(
                &mut reader,
                self.max_response_body_size,
                self.read_timeout,
                "reading origin response body",
            )
            .await
            .map_err(mark_response_too_large)?,
        };

        debug!(
            status = head.status.as_u16(),
            bytes = body.len(),
            origin = %self.target.host,
            "origin exchange complete"
        );
        Ok(UpstreamResponse { head, body })
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamStream>> {
        let host = self.target.host.clone();
        let port = self.target.port;
        let stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(UpstreamConnectError { host, port, source }.into());
                }
                Err(_) => {
                    return Err(anyhow::Error::new(TimedOut)
                        .context(format!("timed out connecting to origin {host}:{port}")));
                }
            };
        stream.set_nodelay(true).ok();

        match &self.tls {
            None => Ok(Box::new(stream)),
            Some(connector) => {
                let server_name = ServerName::try_from(self.target.host.clone())
                    .map_err(|_| anyhow!("invalid TLS server name '{}'", self.target.host))?;
                let tls_stream = timeout_with_context(
                    self.connect_timeout,
                    connector.connect(server_name, stream),
                    format!("completing TLS handshake with origin {}", self.target.host),
                )
                .await?;
                Ok(Box::new(tls_stream))
            }
        }
    }
}

trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> UpstreamStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

fn build_tls_client_config() -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        root_store.add(cert).ok();
    }
    let provider = ring::default_provider();
    let config = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    Ok(config)
}

fn mark_response_too_large(err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<BodyTooLarge>() {
        Ok(body) => ResponseTooLarge {
            bytes_read: body.bytes_read,
        }
        .into(),
        Err(err) => err,
    }
}

fn encode_upstream_request_head(
    method: &Method,
    path_and_query: &str,
    host_header: &str,
    forward_headers: &[Http1HeaderLine],
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(path_and_query.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buffer.extend_from_slice(host_header.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for header in forward_headers {
        buffer.extend_from_slice(header.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(header.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if let Some(body) = body {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body.len().to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::codec::Http1HeaderLine;

    #[test]
    fn request_head_carries_host_and_forwarded_headers() {
        let headers = vec![
            Http1HeaderLine::new("Accept", "application/json"),
            Http1HeaderLine::new("User-Agent", "replaycache-test"),
        ];
        let encoded = encode_upstream_request_head(
            &Method::GET,
            "/widgets?page=2",
            "origin.example",
            &headers,
            None,
        );
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("GET /widgets?page=2 HTTP/1.1\r\n"));
        assert!(text.contains("Host: origin.example\r\n"));
        assert!(text.contains("Accept: application/json\r\n"));
        assert!(!text.contains("Content-Length:"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn request_head_declares_buffered_body_length() {
        let encoded = encode_upstream_request_head(
            &Method::POST,
            "/submit",
            "origin.example",
            &[],
            Some(b"payload"),
        );
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
    }

    #[tokio::test]
    async fn connect_failure_is_typed() -> Result<()> {
        // Port 1 on localhost is almost certainly closed.
        let client = UpstreamClient::new(
            crate::config::ProxyTarget::parse("http://127.0.0.1:1")?,
            Duration::from_millis(500),
            Duration::from_millis(500),
            1024,
            1024,
        )?;
        let err = client
            .exchange(&Method::GET, "/", "127.0.0.1:1", &[], None)
            .await
            .unwrap_err();
        let classified = crate::proxy::forward_error::classify_forward_error(&err);
        assert!(matches!(
            classified,
            crate::proxy::forward_error::ForwardErrorKind::Connect(_)
                | crate::proxy::forward_error::ForwardErrorKind::Timeout
        ));
        Ok(())
    }
}
