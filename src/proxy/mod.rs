pub mod cache;
pub mod forward_error;
pub mod headers;
pub mod http;
pub mod listener;
mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::config::ProxyRoute;
use crate::settings::Settings;
use cache::ContentCache;
use upstream::UpstreamClient;

/// Everything a request-handling task needs, assembled once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub route: Arc<ProxyRoute>,
    pub cache: Arc<ContentCache>,
    pub(crate) upstream: Arc<UpstreamClient>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, route: ProxyRoute) -> Result<Self> {
        let cache = Arc::new(ContentCache::new(settings.cache_dir.clone()));
        let upstream = Arc::new(UpstreamClient::new(
            route.target.clone(),
            settings.upstream_connect_timeout(),
            settings.upstream_read_timeout(),
            settings.max_response_header_size,
            settings.max_response_body_size,
        )?);
        Ok(Self {
            settings,
            route: Arc::new(route),
            cache,
            upstream,
        })
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
