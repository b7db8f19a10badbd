//! Thin REST client for the remote service that hosts identity, tables and object storage.
//! Every request carries the api-key headers and an explicit timeout.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::Config;

pub const AUTH_TOKEN_PATH: &str = "auth/v1/token";
pub const AUTH_USER_PATH: &str = "auth/v1/user";
pub const REST_ROOT_PATH: &str = "rest/v1/";

#[derive(Clone)]
pub struct BackendClient {
    base: String,
    key: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base: &str, key: &str, timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), key: key.to_string(), http })
    }

    /// Client using the public key, as the interactive shell does.
    pub fn for_client(cfg: &Config) -> reqwest::Result<Self> {
        Self::new(&cfg.backend_url, &cfg.backend_key, cfg.request_timeout)
    }

    /// Client using the service key, as the API server does.
    pub fn for_service(cfg: &Config) -> reqwest::Result<Self> {
        Self::new(&cfg.backend_url, &cfg.service_key, cfg.request_timeout)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Headers identifying this client; the bearer defaults to the api key.
    pub fn headers(&self, bearer: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.key) { h.insert("apikey", v); }
        let token = bearer.unwrap_or(&self.key);
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) { h.insert(AUTHORIZATION, v); }
        h
    }

    pub fn table_path(table: &str) -> String { format!("rest/v1/{}", urlencoding::encode(table)) }

    pub fn object_path(bucket: &str, filename: &str) -> String {
        format!("storage/v1/object/{}/{}", urlencoding::encode(bucket), urlencoding::encode(filename))
    }

    /// Public read URL of an uploaded object.
    pub fn public_object_url(&self, bucket: &str, filename: &str) -> String {
        self.url(&format!("storage/v1/object/public/{}/{}", urlencoding::encode(bucket), urlencoding::encode(filename)))
    }

    pub async fn get<Q: Serialize + ?Sized>(&self, path: &str, query: &Q, bearer: Option<&str>) -> reqwest::Result<reqwest::Response> {
        self.http.get(self.url(path)).headers(self.headers(bearer)).query(query).send().await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.http.post(self.url(path)).headers(self.headers(None)).query(query).json(body).send().await
    }

    pub async fn post_bytes(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> reqwest::Result<reqwest::Response> {
        let mut headers = self.headers(None);
        if let Ok(v) = HeaderValue::from_str(content_type) { headers.insert(CONTENT_TYPE, v); }
        self.http.post(self.url(path)).headers(headers).body(bytes).send().await
    }
}

/// Build a `column=eq.value` filter pair for the tabular endpoint.
pub fn eq_filter(column: &str, value: &str) -> (String, String) {
    (column.to_string(), format!("eq.{}", value))
}

/// Read an error body for logs and error details without failing the caller.
pub async fn error_detail(resp: reqwest::Response) -> String {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    if body.is_empty() { format!("HTTP {}", status) } else { format!("HTTP {}: {}", status, body) }
}
