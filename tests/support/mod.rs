#![allow(dead_code)]

mod upstream;

pub use upstream::TestUpstream;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use replaycache::{
    cli::LogFormat,
    config::{ProxyConfig, ProxyRoute},
    proxy::{self, AppContext},
    settings::Settings,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_settings(cache_dir: PathBuf) -> Settings {
    Settings {
        host: Ipv4Addr::LOCALHOST.into(),
        port: 0,
        cache_dir,
        proxy_config: None,
        log: LogFormat::Text,
        client_read_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_read_timeout: 5,
        max_request_header_size: 32 * 1024,
        max_request_body_size: 1024 * 1024,
        max_response_header_size: 32 * 1024,
        max_response_body_size: 1024 * 1024,
    }
}

pub fn proxy_config_for(target: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.target = target.to_string();
    config
}

/// A running proxy over a temporary cache directory.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _temp: TempDir,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn(target: &str) -> Result<Self> {
        Self::spawn_with_config(proxy_config_for(target)).await
    }

    pub async fn spawn_with_config(config: ProxyConfig) -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("records");
        let settings = test_settings(cache_dir.clone());
        let route = ProxyRoute::compile(&config)?;
        let app = AppContext::new(Arc::new(settings), route)?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = proxy::listener::serve(app, listener).await;
        });

        Ok(Self {
            addr,
            cache_dir,
            _temp: temp,
            handle,
        })
    }

    /// Number of record directories currently on disk.
    pub fn record_count(&self) -> usize {
        match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries.filter_map(|entry| entry.ok()).count(),
            Err(_) => 0,
        }
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn get_request(path: &str, host: &str, close: bool) -> String {
    let connection = if close { "Connection: close\r\n" } else { "" };
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n{connection}\r\n")
}

pub async fn send_request(addr: SocketAddr, raw: &str) -> Result<HttpResponse> {
    timeout(CLIENT_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(raw.as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        read_response(&mut reader).await
    })
    .await
    .map_err(|_| anyhow!("timed out talking to proxy"))?
}

/// Issue a simple GET through the proxy with Connection: close.
pub async fn get(addr: SocketAddr, path: &str) -> Result<HttpResponse> {
    send_request(addr, &get_request(path, "cache.test", true)).await
}

pub async fn read_response<S>(reader: &mut BufReader<S>) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status_line = status_line.trim_end();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().context("missing HTTP version")?;
    if version != "HTTP/1.1" {
        bail!("unexpected version in '{status_line}'");
    }
    let status: u16 = parts
        .next()
        .context("missing status code")?
        .parse()
        .with_context(|| format!("bad status in '{status_line}'"))?;

    let mut headers = BTreeMap::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            bail!("connection closed during response headers");
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }
    }

    let body = match headers.get("content-length") {
        Some(length) => {
            let length: usize = length.parse().context("bad content-length")?;
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await?;
            body
        }
    };

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
