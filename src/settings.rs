use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9876
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".proxy_cache")
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_client_read_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_read_timeout() -> u64 {
    60
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_response_body_size() -> usize {
    64 * 1024 * 1024
}

/// Runtime settings, resolved once at startup.
///
/// Precedence, highest first: command-line flags, `REPLAYCACHE__*` environment
/// variables, built-in defaults. The proxy routing configuration (origin
/// target, rewrites) lives in its own optional file, see [`crate::config`].
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub proxy_config: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_read_timeout")]
    pub client_read_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_read_timeout")]
    pub upstream_read_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_response_body_size")]
    pub max_response_body_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(
                Environment::with_prefix("REPLAYCACHE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = cli.host {
            self.host = host;
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = cache_dir.clone();
        }
        if let Some(proxy_config) = &cli.proxy_config {
            self.proxy_config = Some(proxy_config.clone());
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_read_timeout > 0,
            "client_read_timeout must be greater than 0 seconds (got {})",
            self.client_read_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_read_timeout > 0,
            "upstream_read_timeout must be greater than 0 seconds (got {})",
            self.upstream_read_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_response_body_size > 0,
            "max_response_body_size must be greater than 0 (got {})",
            self.max_response_body_size
        );
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        Ok(())
    }

    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_secs(self.client_read_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_read_timeout)
    }

    /// The proxy configuration file to read, if any. An explicitly named file
    /// is always returned; the default candidate only when it exists, since a
    /// missing config file simply means built-in defaults.
    pub fn proxy_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.proxy_config {
            return Some(path.clone());
        }
        let candidate = PathBuf::from(".proxy.toml");
        candidate.exists().then_some(candidate)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            host: default_host(),
            port: default_port(),
            cache_dir: default_cache_dir(),
            proxy_config: None,
            log: LogFormat::Text,
            client_read_timeout: 30,
            upstream_connect_timeout: 5,
            upstream_read_timeout: 60,
            max_request_header_size: 1024,
            max_request_body_size: 1024,
            max_response_header_size: 1024,
            max_response_body_size: 1024,
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeouts_and_limits() {
        let mut settings = base_settings();
        settings.upstream_read_timeout = 0;
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.max_response_body_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.cache_dir = PathBuf::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = Cli {
            host: Some("127.0.0.1".parse().unwrap()),
            port: Some(8080),
            cache_dir: Some(PathBuf::from("/tmp/records")),
            proxy_config: Some(PathBuf::from("proxy.toml")),
            log: Some(LogFormat::Text),
        };
        let mut settings = base_settings();
        settings.apply_cli(&cli);
        assert_eq!(settings.listen().to_string(), "127.0.0.1:8080");
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/records"));
        assert_eq!(
            settings.proxy_config_path(),
            Some(PathBuf::from("proxy.toml"))
        );
        assert_eq!(settings.log, LogFormat::Text);
    }
}
