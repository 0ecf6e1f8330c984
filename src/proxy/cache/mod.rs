use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use tokio::fs as async_fs;
use tracing::{debug, warn};

mod key;
mod record;

use key::{CacheKey, is_cacheable_method};
use record::{RecordPaths, headers_from_json, headers_to_json, normalize_json_body, write_field};

/// Diagnostic marker header on every proxied response.
pub const MARKER_HEADER: &str = "x-cache-proxy";
pub const MARKER_HIT: &str = "hit";
pub const MARKER_MISS: &str = "miss";

/// Stored response headers replayed onto a cache hit. Everything else in the
/// record is diagnostic: replaying transport headers like content-length or
/// connection from the original capture would misstate the replayed payload.
const PASS_THROUGH_HEADERS: &[&str] = &["content-type"];

const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct CachedResponse {
    headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl CachedResponse {
    /// The allow-listed subset of stored headers for the outgoing response.
    pub fn pass_through_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        PASS_THROUGH_HEADERS.iter().filter_map(|name| {
            self.headers
                .get(*name)
                .map(|value| (*name, value.as_str()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Skipped,
}

/// The on-disk response cache. One directory per record id under `root`,
/// three files per record (`url`, `headers`, `body`); the `headers` file is
/// the sole presence signal. No in-memory index and no eviction: existence
/// checks against the filesystem are the index, and records live until
/// overwritten or removed externally.
#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Looks up the record for a request. Returns `None` for every miss:
    /// non-GET methods, absent records, and records that exist but cannot be
    /// read back (those are logged and treated as if absent).
    pub async fn lookup(
        &self,
        method: &Method,
        host: &str,
        path_and_query: &str,
    ) -> Option<CachedResponse> {
        if !is_cacheable_method(method) {
            return None;
        }

        let cache_key = CacheKey::new(host, path_and_query);
        let paths = RecordPaths::new(&self.root, cache_key.record_id());
        let hit = async_fs::try_exists(&paths.headers).await.unwrap_or(false);
        debug!(
            result = if hit { "hit" } else { "miss" },
            record = %paths.directory.display(),
            url = cache_key.effective_url(),
            "cache lookup"
        );
        if !hit {
            return None;
        }

        let headers_raw = match async_fs::read(&paths.headers).await {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    error = %err,
                    record = %paths.directory.display(),
                    "stored headers unreadable, treating as miss"
                );
                return None;
            }
        };
        let headers = match headers_from_json(&headers_raw) {
            Ok(headers) => headers,
            Err(err) => {
                warn!(
                    error = %err,
                    record = %paths.directory.display(),
                    "stored headers corrupt, treating as miss"
                );
                return None;
            }
        };
        let body = match async_fs::read(&paths.body).await {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    error = %err,
                    record = %paths.directory.display(),
                    "stored body unreadable, treating as miss"
                );
                return None;
            }
        };

        Some(CachedResponse {
            headers,
            body: Bytes::from(body),
        })
    }

    /// Persists a buffered upstream response when it passes the cacheability
    /// gate: GET request, status exactly 200. `url` and `body` land before
    /// `headers` so a record never becomes visible without its payload; a
    /// later store for the same key overwrites field by field,
    /// last-writer-wins.
    pub async fn store(
        &self,
        method: &Method,
        host: &str,
        path_and_query: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<StoreOutcome> {
        if !is_cacheable_method(method) || status != StatusCode::OK {
            return Ok(StoreOutcome::Skipped);
        }

        let cache_key = CacheKey::new(host, path_and_query);
        let paths = RecordPaths::new(&self.root, cache_key.record_id());
        async_fs::create_dir_all(&paths.directory)
            .await
            .with_context(|| format!("failed to create record {}", paths.directory.display()))?;

        let headers_json = headers_to_json(headers)?;
        let body_out: Cow<'_, [u8]> = if has_json_content_type(headers) {
            match normalize_json_body(body) {
                Ok(normalized) => Cow::Owned(normalized),
                Err(err) => {
                    warn!(
                        error = %err,
                        url = cache_key.effective_url(),
                        "declared JSON body did not parse, storing raw bytes"
                    );
                    Cow::Borrowed(body)
                }
            }
        } else {
            Cow::Borrowed(body)
        };

        tokio::try_join!(
            write_field(&paths, &paths.url, cache_key.effective_url().as_bytes()),
            write_field(&paths, &paths.body, &body_out),
        )?;
        write_field(&paths, &paths.headers, &headers_json).await?;

        debug!(
            record = %paths.directory.display(),
            url = cache_key.effective_url(),
            "cache store"
        );
        Ok(StoreOutcome::Stored)
    }
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(JSON_MEDIA_TYPE)
        })
        .unwrap_or(false)
}
