//! HTTP surface for served cache values.
//!
//! Maps [`ResponseMeta`] onto `Cache-Control` and `X-Cache` so CDNs and
//! browsers reuse a response exactly as long as the cache would.

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use freshcache_types::{CacheSource, OutputFormat, RequestFlags, ResponseMeta};
use serde::Serialize;

use crate::cache::{ServeError, Served};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

const STALE_IF_ERROR_SECONDS: u64 = 60;

/// `Cache-Control` value for a response carrying `meta`.
pub fn cache_control(meta: &ResponseMeta) -> HeaderValue {
    match meta.source {
        CacheSource::OriginError => HeaderValue::from_static("no-store"),
        CacheSource::Stale => HeaderValue::from_str(&format!(
            "public, max-age=0, stale-if-error={STALE_IF_ERROR_SECONDS}"
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("no-store")),
        CacheSource::Cache | CacheSource::Origin if meta.ttl_seconds == 0 => {
            HeaderValue::from_static("no-store")
        }
        CacheSource::Cache | CacheSource::Origin => {
            HeaderValue::from_str(&format!("public, max-age={}", meta.ttl_seconds))
                .unwrap_or_else(|_| HeaderValue::from_static("no-store"))
        }
    }
}

/// Insert `Cache-Control` and `X-Cache` for `meta`.
pub fn apply_meta(headers: &mut HeaderMap, meta: &ResponseMeta) {
    headers.insert(header::CACHE_CONTROL, cache_control(meta));
    let x_cache = match meta.source {
        CacheSource::Cache => "HIT",
        CacheSource::Origin => "MISS",
        CacheSource::Stale => "STALE",
        CacheSource::OriginError => "ERROR",
    };
    headers.insert(X_CACHE, HeaderValue::from_static(x_cache));
}

/// Request flags from `Cache-Control`/`Pragma` headers and a `nocache` query flag.
///
/// The requester role is left anonymous; authentication layers set it.
pub fn request_flags(headers: &HeaderMap, query: Option<&str>) -> RequestFlags {
    let header_no_cache = [header::CACHE_CONTROL, header::PRAGMA].iter().any(|name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                value
                    .split(',')
                    .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
            })
    });

    let query_no_cache = query_param(query, "nocache")
        .is_some_and(|value| matches!(value, "" | "1" | "true" | "yes"));

    RequestFlags {
        no_cache: header_no_cache || query_no_cache,
        ..RequestFlags::default()
    }
}

/// Output format from `?format=`; anything unrecognised is `full`.
pub fn output_format(query: Option<&str>) -> OutputFormat {
    query_param(query, "format")
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

#[derive(Serialize)]
struct Envelope<'a, B> {
    data: &'a B,
    meta: &'a ResponseMeta,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    meta: &'a ResponseMeta,
}

impl<B: Serialize> IntoResponse for Served<B> {
    fn into_response(self) -> Response {
        let mut response = Json(Envelope {
            data: &self.body,
            meta: &self.meta,
        })
        .into_response();
        apply_meta(response.headers_mut(), &self.meta);
        response
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error.kind(),
            message: self.error.to_string(),
            meta: &self.meta,
        };
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        apply_meta(response.headers_mut(), &self.meta);
        response
    }
}
