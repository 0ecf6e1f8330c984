use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, File, FileFormat};
use http::Uri;
use serde::Deserialize;

const DEFAULT_TARGET: &str = "https://httpbin.org";

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

fn default_change_origin() -> bool {
    true
}

/// Raw proxy routing configuration as it appears in the optional config
/// file. A missing file means built-in defaults; file-provided fields
/// override the defaults field by field.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_change_origin")]
    pub change_origin: bool,
    #[serde(default)]
    pub path_rewrite: Vec<PathRewrite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathRewrite {
    pub prefix: String,
    pub replace: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            change_origin: default_change_origin(),
            path_rewrite: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Reads the configuration file when it exists; otherwise returns the
    /// defaults. Absence of the file is never an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()
            .with_context(|| format!("failed to read proxy config {}", path.display()))?;
        cfg.try_deserialize()
            .with_context(|| format!("invalid proxy config {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// The parsed origin target. `host_header` preserves the authority exactly as
/// written in the config so `change_origin` rewrites match what the operator
/// configured (explicit port kept, default port omitted).
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    host_header: String,
}

impl ProxyTarget {
    pub fn parse(target: &str) -> Result<Self> {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("invalid proxy target '{target}'"))?;
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => bail!("unsupported proxy target scheme '{other}'"),
            None => bail!("proxy target '{target}' must include a scheme"),
        };
        let host = uri
            .host()
            .with_context(|| format!("proxy target '{target}' must include a host"))?
            .to_string();
        ensure!(!host.is_empty(), "proxy target host must not be empty");
        match uri.path_and_query() {
            None => {}
            Some(pq) if pq.as_str() == "/" => {}
            Some(pq) => bail!(
                "proxy target '{target}' must not carry a path or query (got '{}')",
                pq.as_str()
            ),
        }
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        let host_header = match uri.port_u16() {
            Some(explicit) => format!("{host}:{explicit}"),
            None => host.clone(),
        };
        Ok(Self {
            scheme,
            host,
            port,
            host_header,
        })
    }

    pub fn host_header(&self) -> &str {
        &self.host_header
    }
}

/// Compiled routing rules: validated target plus the path rewrites applied to
/// every forwarded request. The cache key is derived from the inbound request
/// before any rewrite.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    pub target: ProxyTarget,
    pub change_origin: bool,
    rewrites: Vec<PathRewrite>,
}

impl ProxyRoute {
    pub fn compile(config: &ProxyConfig) -> Result<Self> {
        let target = ProxyTarget::parse(&config.target)?;
        for rewrite in &config.path_rewrite {
            ensure!(
                !rewrite.prefix.is_empty(),
                "path_rewrite prefix must not be empty"
            );
        }
        Ok(Self {
            target,
            change_origin: config.change_origin,
            rewrites: config.path_rewrite.clone(),
        })
    }

    /// Applies the first matching prefix rule, once. Rules never touch the
    /// query string.
    pub fn rewrite_path(&self, path_and_query: &str) -> String {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        for rewrite in &self.rewrites {
            if let Some(rest) = path.strip_prefix(rewrite.prefix.as_str()) {
                let rewritten = format!("{}{}", rewrite.replace, rest);
                return match query {
                    Some(query) => format!("{rewritten}?{query}"),
                    None => rewritten,
                };
            }
        }
        path_and_query.to_string()
    }
}
