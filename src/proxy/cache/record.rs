use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use http::HeaderMap;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

/// File layout of one persisted record: a directory named by the record id
/// holding the three fields. `headers` is the presence marker and must be the
/// last field written.
#[derive(Debug, Clone)]
pub(super) struct RecordPaths {
    pub directory: PathBuf,
    pub url: PathBuf,
    pub headers: PathBuf,
    pub body: PathBuf,
}

impl RecordPaths {
    pub(super) fn new(root: &Path, record_id: &str) -> Self {
        let directory = root.join(record_id);
        Self {
            url: directory.join("url"),
            headers: directory.join("headers"),
            body: directory.join("body"),
            directory,
        }
    }
}

/// Serializes a response header set as pretty-printed JSON. Keys are
/// lowercased header names; repeated headers collapse into one comma-joined
/// value. Values that are not valid UTF-8 are dropped rather than mangled.
pub(super) fn headers_to_json(headers: &HeaderMap) -> Result<Vec<u8>> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    serde_json::to_vec_pretty(&map).context("failed to serialize response headers")
}

pub(super) fn headers_from_json(data: &[u8]) -> Result<BTreeMap<String, String>> {
    serde_json::from_slice(data).context("failed to parse stored headers")
}

/// Re-serializes a JSON payload with stable pretty formatting. Semantically
/// lossless; not byte-identical to the origin's bytes.
pub(super) fn normalize_json_body(body: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value =
        serde_json::from_slice(body).context("upstream body is not valid JSON")?;
    serde_json::to_vec_pretty(&value).context("failed to re-serialize JSON body")
}

/// Writes one record field: temp file in the record directory, then rename
/// into place so a concurrently reading lookup never observes a half-written
/// field file.
pub(super) async fn write_field(paths: &RecordPaths, final_path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = paths
        .directory
        .join(format!("tmp_{}", uuid::Uuid::new_v4()));

    let mut options = async_fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(&temp_path)
        .await
        .with_context(|| format!("failed to open {}", temp_path.display()))?;

    let result = async {
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        async_fs::rename(&temp_path, final_path).await
    }
    .await;

    if result.is_err() {
        async_fs::remove_file(&temp_path).await.ok();
    }
    result.with_context(|| format!("failed to persist {}", final_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use tempfile::TempDir;

    #[test]
    fn header_json_round_trips_and_joins_repeats() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let serialized = headers_to_json(&headers)?;
        let text = String::from_utf8(serialized.clone()).unwrap();
        assert!(text.contains('\n'), "headers should be pretty-printed");

        let parsed = headers_from_json(&serialized)?;
        assert_eq!(
            parsed.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(parsed.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
        Ok(())
    }

    #[test]
    fn header_json_drops_non_utf8_values() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-binary",
            HeaderValue::from_bytes(b"foo\xffbar").unwrap(),
        );
        headers.insert("x-plain", HeaderValue::from_static("ok"));
        let parsed = headers_from_json(&headers_to_json(&headers)?)?;
        assert!(!parsed.contains_key("x-binary"));
        assert_eq!(parsed.get("x-plain").map(String::as_str), Some("ok"));
        Ok(())
    }

    #[test]
    fn json_normalization_preserves_structure() -> Result<()> {
        let normalized = normalize_json_body(br#"{"a":1,"b":[true,null]}"#)?;
        let reparsed: serde_json::Value = serde_json::from_slice(&normalized)?;
        let original: serde_json::Value = serde_json::from_slice(br#"{"a":1,"b":[true,null]}"#)?;
        assert_eq!(reparsed, original);
        Ok(())
    }

    #[test]
    fn json_normalization_is_idempotent() -> Result<()> {
        let once = normalize_json_body(br#"{"a": 1}"#)?;
        let twice = normalize_json_body(&once)?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn json_normalization_rejects_invalid_input() {
        let err = normalize_json_body(b"{ truncated").unwrap_err();
        assert!(
            err.to_string().contains("not valid JSON"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn write_field_leaves_no_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = RecordPaths::new(dir.path(), "aa11");
        async_fs::create_dir_all(&paths.directory).await?;

        write_field(&paths, &paths.body, b"payload").await?;
        assert_eq!(async_fs::read(&paths.body).await?, b"payload");

        let mut entries = async_fs::read_dir(&paths.directory).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["body".to_string()]);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_files_use_restrictive_permissions() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let paths = RecordPaths::new(dir.path(), "bb22");
        async_fs::create_dir_all(&paths.directory).await?;
        write_field(&paths, &paths.headers, b"{}").await?;

        let mode = std::fs::metadata(&paths.headers)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }
}
