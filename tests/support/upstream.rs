use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Minimal scripted origin: answers every request with one canned response,
/// counting requests and capturing request heads for assertions.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn respond_with(response: impl Into<Vec<u8>>) -> Result<Self> {
        let response = Arc::new(response.into());
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));

        let accept_requests = requests.clone();
        let accept_captured = captured.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let response = response.clone();
                let requests = accept_requests.clone();
                let captured = accept_captured.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(&mut stream, &response, &requests, &captured).await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            captured,
            handle,
        })
    }

    pub async fn http_ok(body: &str, extra_headers: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
            body.len(),
            extra_headers,
            body
        );
        Self::respond_with(response.into_bytes()).await
    }

    pub async fn http_status(status_line: &str, body: &str) -> Result<Self> {
        let response = format!(
            "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        Self::respond_with(response.into_bytes()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn target(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Request heads (everything up to the blank line) in arrival order.
    pub fn captured_heads(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    response: &[u8],
    requests: &AtomicUsize,
    captured: &Mutex<Vec<String>>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let read = stream.read(&mut buf).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    if data.is_empty() {
        return Ok(());
    }

    requests.fetch_add(1, Ordering::SeqCst);
    let head_end = data
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .unwrap_or(data.len());
    captured
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&data[..head_end]).into_owned());

    stream.write_all(response).await?;
    stream.shutdown().await.ok();
    Ok(())
}
