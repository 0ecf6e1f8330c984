use http::Method;

/// Identity of one cache record: the effective URL (Host header plus
/// path+query, exactly as received) and its BLAKE3 hex digest, which names
/// the record directory on disk.
#[derive(Debug, Clone)]
pub(crate) struct CacheKey {
    effective_url: String,
    record_id: String,
}

impl CacheKey {
    pub(crate) fn new(host: &str, path_and_query: &str) -> Self {
        let effective_url = format!("{host}{path_and_query}");
        let record_id = Self::record_id_for_url(&effective_url);
        Self {
            effective_url,
            record_id,
        }
    }

    pub(crate) fn effective_url(&self) -> &str {
        &self.effective_url
    }

    pub(crate) fn record_id(&self) -> &str {
        &self.record_id
    }

    pub(crate) fn record_id_for_url(effective_url: &str) -> String {
        blake3::hash(effective_url.as_bytes()).to_hex().to_string()
    }
}

/// The cacheability gate on the request side: only retrieval-style requests
/// are ever looked up or stored.
pub(crate) fn is_cacheable_method(method: &Method) -> bool {
    method == Method::GET
}
