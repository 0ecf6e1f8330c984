use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "replaycache", about = "Transparent HTTP reverse-proxy cache")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding cached response records.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Path to the proxy configuration file (defaults to ./.proxy.toml if present).
    #[arg(long)]
    pub proxy_config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
