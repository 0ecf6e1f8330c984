use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::util::timeout_with_context;

use super::line::read_line_with_timeout;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
#[error("body exceeds configured limit")]
pub struct BodyTooLarge {
    pub bytes_read: u64,
}

/// Reads exactly `length` bytes, failing early when the declared length
/// already exceeds the limit.
pub(crate) async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: usize,
    limit: usize,
    timeout_dur: Duration,
    context: &str,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    if length > limit {
        return Err(BodyTooLarge {
            bytes_read: length as u64,
        }
        .into());
    }
    let mut collected = vec![0u8; length];
    let mut filled = 0usize;
    while filled < length {
        let read = timeout_with_context(timeout_dur, reader.read(&mut collected[filled..]), context)
            .await?;
        if read == 0 {
            bail!("unexpected EOF while {context}");
        }
        filled += read;
    }
    Ok(Bytes::from(collected))
}

/// Decodes a chunked body fully, discarding any trailers. Chunk extensions
/// after ';' are ignored.
pub(crate) async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    limit: usize,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        let size_bytes =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailer section: discard lines until the blank terminator.
            loop {
                line.clear();
                let read = read_line_with_timeout(
                    reader,
                    &mut line,
                    timeout_dur,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("unexpected EOF while reading trailers from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        if collected.len().saturating_add(chunk_size) > limit {
            return Err(BodyTooLarge {
                bytes_read: (collected.len() + chunk_size) as u64,
            }
            .into());
        }

        let start = collected.len();
        collected.resize(start + chunk_size, 0);
        let mut filled = start;
        while filled < collected.len() {
            let read = timeout_with_context(
                timeout_dur,
                reader.read(&mut collected[filled..]),
                format!("reading chunk data from {peer}"),
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk data from {peer}");
            }
            filled += read;
        }

        line.clear();
        let read =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if read == 0 || !line.trim_end_matches(['\r', '\n']).is_empty() {
            bail!("malformed chunk terminator from {peer}");
        }
    }

    Ok(Bytes::from(collected))
}

/// Reads until the peer closes the stream (HTTP/1.1 responses with neither
/// Content-Length nor chunked framing).
pub(crate) async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    limit: usize,
    timeout_dur: Duration,
    context: &str,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read =
            timeout_with_context(timeout_dur, reader.read(&mut buffer), context).await?;
        if read == 0 {
            break;
        }
        if collected.len().saturating_add(read) > limit {
            return Err(BodyTooLarge {
                bytes_read: (collected.len() + read) as u64,
            }
            .into());
        }
        collected.extend_from_slice(&buffer[..read]);
    }
    Ok(Bytes::from(collected))
}
