pub mod cli;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{ProxyConfig, ProxyRoute};
use crate::proxy::AppContext;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let proxy_config = ProxyConfig::load(settings.proxy_config_path().as_deref())?;
    let route = ProxyRoute::compile(&proxy_config)?;
    tracing::info!(
        origin = %proxy_config.target,
        change_origin = proxy_config.change_origin,
        cache_dir = %settings.cache_dir.display(),
        "proxy configured"
    );
    let app = AppContext::new(Arc::new(settings), route)?;
    proxy::run(app).await
}
