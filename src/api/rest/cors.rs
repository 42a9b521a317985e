//! CORS policy for the admin/tick surface.
//!
//! A plain allow-list rather than a trie-based origin matcher: this
//! surface is called exclusively by the scheduler's tick source and the
//! admin console, never by public browser traffic, so a small `Vec` scan
//! is sufficient.

use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        tracing::warn!("CORS: no allowed origins configured; cross-origin requests will be rejected");
        return CorsLayer::new();
    }
    let origins: Vec<http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_methods([http::Method::POST])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_origin(AllowOrigin::list(origins))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_yields_restrictive_layer() {
        let _layer = build_cors_layer(&[]);
    }
}
