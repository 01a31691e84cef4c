use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::debug;

use super::CacheBackend;
use crate::cache::error::StoreError;

const BACKEND: &str = "edge_kv";
/// Shortest `expiration_ttl` the edge accepts.
const MIN_EDGE_TTL_SECS: u64 = 60;
const DEADLINE_LEN: usize = 8;
const LIST_PAGE_LIMIT: &str = "1000";

/// Connection details for a Workers KV namespace.
#[derive(Debug, Clone)]
pub struct EdgeKvConfig {
    /// API root, e.g. `https://api.cloudflare.com/client/v4/`.
    pub api_base: Url,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    pub request_timeout: Duration,
}

impl From<&crate::config::EdgeKvSettings> for EdgeKvConfig {
    fn from(settings: &crate::config::EdgeKvSettings) -> Self {
        Self {
            api_base: settings.api_base.clone(),
            account_id: settings.account_id.clone(),
            namespace_id: settings.namespace_id.clone(),
            api_token: settings.api_token.clone(),
            request_timeout: settings.request_timeout,
        }
    }
}

/// Backend speaking the Workers KV REST API.
///
/// The edge rounds short TTLs up to its minimum, so every stored value is
/// prefixed with its own big-endian unix-millisecond deadline and reads past
/// that deadline are misses.
#[derive(Clone)]
pub struct EdgeKvBackend {
    client: Client,
    config: EdgeKvConfig,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ListInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListInfo {
    #[serde(default)]
    cursor: Option<String>,
}

impl EdgeKvBackend {
    pub fn new(config: EdgeKvConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent(concat!("freshcache/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| StoreError::unavailable(BACKEND, "connect", err.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, op: &'static str, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.config.api_base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| StoreError::unavailable(BACKEND, op, "api base cannot hold a path"))?;
            path.pop_if_empty().extend([
                "accounts",
                self.config.account_id.as_str(),
                "storage",
                "kv",
                "namespaces",
                self.config.namespace_id.as_str(),
            ]);
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.api_token)
    }

    async fn send(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        request
            .send()
            .await
            .map_err(|err| StoreError::unavailable(BACKEND, op, err.to_string()))
    }
}

#[async_trait]
impl CacheBackend for EdgeKvBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let url = self.url("get", &["values", key])?;
        let response = self.send("get", self.request(Method::GET, url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(StoreError::status(BACKEND, "get", status.as_u16()));
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::unavailable(BACKEND, "get", err.to_string()))?;
        let value = unframe(body, now_millis())?;
        if value.is_none() {
            debug!(key, backend = BACKEND, "Edge value past its deadline");
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut url = self.url("set", &["values", key])?;
        url.query_pairs_mut()
            .append_pair("expiration_ttl", &edge_ttl(ttl).to_string());

        let deadline = now_millis().saturating_add(duration_millis(ttl));
        let response = self
            .send(
                "set",
                self.request(Method::PUT, url).body(frame(deadline, &value)),
            )
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::status(BACKEND, "set", response.status().as_u16()))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self.url("delete", &["values", key])?;
        let response = self.send("delete", self.request(Method::DELETE, url)).await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StoreError::status(BACKEND, "delete", status.as_u16()))
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.url("list", &["keys"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", LIST_PAGE_LIMIT);
                if !prefix.is_empty() {
                    query.append_pair("prefix", prefix);
                }
                if let Some(cursor) = &cursor {
                    query.append_pair("cursor", cursor);
                }
            }

            let response = self.send("list", self.request(Method::GET, url)).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StoreError::status(BACKEND, "list", status.as_u16()));
            }
            let page: ListResponse = response
                .json()
                .await
                .map_err(|err| StoreError::Decode(err.to_string()))?;

            keys.extend(page.result.into_iter().map(|listed| listed.name));

            match page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|cursor| !cursor.is_empty())
            {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }
}

fn frame(deadline_ms: u64, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DEADLINE_LEN + value.len());
    buf.put_u64(deadline_ms);
    buf.put_slice(value);
    buf.freeze()
}

fn unframe(mut body: Bytes, now_ms: u64) -> Result<Option<Bytes>, StoreError> {
    if body.len() < DEADLINE_LEN {
        return Err(StoreError::Decode(format!(
            "edge value shorter than its {DEADLINE_LEN}-byte deadline"
        )));
    }
    let payload = body.split_off(DEADLINE_LEN);
    let mut deadline = [0u8; DEADLINE_LEN];
    deadline.copy_from_slice(&body);

    if now_ms >= u64::from_be_bytes(deadline) {
        Ok(None)
    } else {
        Ok(Some(payload))
    }
}

fn edge_ttl(ttl: Duration) -> u64 {
    ttl.as_secs().max(MIN_EDGE_TTL_SECS)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_millis() -> u64 {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn backend(server: &MockServer) -> EdgeKvBackend {
        EdgeKvBackend::new(EdgeKvConfig {
            api_base: Url::parse(&server.base_url()).expect("base url"),
            account_id: "acct".to_string(),
            namespace_id: "ns".to_string(),
            api_token: "token".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("backend")
    }

    const VALUES: &str = "/accounts/acct/storage/kv/namespaces/ns/values";

    #[tokio::test]
    async fn get_returns_payload_before_deadline() {
        let server = MockServer::start();
        let body = frame(now_millis() + 60_000, b"{\"v\":1}");
        let mock = server.mock(|when, then| {
            when.method("GET")
                .path(format!("{VALUES}/home:top"))
                .header("authorization", "Bearer token");
            then.status(200).body(body.to_vec());
        });

        let value = backend(&server).get("home:top").await.expect("get");
        mock.assert();
        assert_eq!(value, Some(Bytes::from_static(b"{\"v\":1}")));
    }

    #[tokio::test]
    async fn get_treats_past_deadline_as_miss() {
        let server = MockServer::start();
        let body = frame(now_millis().saturating_sub(1_000), b"old");
        server.mock(|when, then| {
            when.method("GET").path(format!("{VALUES}/k2"));
            then.status(200).body(body.to_vec());
        });

        assert_eq!(backend(&server).get("k2").await.expect("get"), None);
    }

    #[tokio::test]
    async fn get_maps_not_found_to_miss_and_errors_to_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path(format!("{VALUES}/missing"));
            then.status(404);
        });
        server.mock(|when, then| {
            when.method("GET").path(format!("{VALUES}/broken"));
            then.status(503);
        });

        let backend = backend(&server);
        assert_eq!(backend.get("missing").await.expect("miss"), None);
        let err = backend.get("broken").await.expect_err("status error");
        assert!(matches!(err, StoreError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn set_rounds_short_ttl_up_to_edge_minimum() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("PUT")
                .path(format!("{VALUES}/breaking"))
                .query_param("expiration_ttl", "60");
            then.status(200).body("{\"success\":true}");
        });

        backend(&server)
            .set("breaking", Bytes::from_static(b"x"), Duration::from_secs(30))
            .await
            .expect("set");
        mock.assert();
    }

    #[tokio::test]
    async fn delete_tolerates_missing_keys() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("DELETE").path(format!("{VALUES}/gone"));
            then.status(404);
        });

        backend(&server).delete("gone").await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn listing_follows_cursor_pages() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method("GET")
                .path("/accounts/acct/storage/kv/namespaces/ns/keys")
                .query_param("prefix", "home:")
                .query_param_missing("cursor");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"success":true,"result":[{"name":"home:a"}],"result_info":{"cursor":"c1"}}"#,
                );
        });
        let second = server.mock(|when, then| {
            when.method("GET")
                .path("/accounts/acct/storage/kv/namespaces/ns/keys")
                .query_param("prefix", "home:")
                .query_param("cursor", "c1");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"success":true,"result":[{"name":"home:b"}],"result_info":{"cursor":""}}"#,
                );
        });

        let keys = backend(&server)
            .keys_with_prefix("home:")
            .await
            .expect("list");
        first.assert();
        second.assert();
        assert_eq!(keys, vec!["home:a".to_string(), "home:b".to_string()]);
    }

    #[test]
    fn truncated_frames_are_decode_errors() {
        let err = unframe(Bytes::from_static(b"abc"), 0).expect_err("too short");
        assert!(matches!(err, StoreError::Decode(_)));
    }
}
