use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Writes a proxy-generated plain-text error response. These always close the
/// connection; the client cannot know how much of its request was consumed.
pub(crate) async fn send_error_response<S>(
    stream: &mut S,
    status: StatusCode,
    message: &str,
    timeout_dur: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{message}\n");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error"),
        body.len(),
    );
    timeout_with_context(
        timeout_dur,
        async {
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(body.as_bytes()).await?;
            stream.flush().await
        },
        "writing error response to client",
    )
    .await
}
