use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;

use crate::backend::{BackendClient, REST_ROOT_PATH};
use crate::config::Config;

/// Advisory connectivity checks. A `false` never means the remote is down for sure.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn has_internet(&self) -> bool;
    async fn has_backend(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ready,
    BackendUnavailable,
    Offline,
}

impl ConnectionStatus {
    pub fn message(&self) -> &'static str {
        match self {
            ConnectionStatus::Ready => "Connected - Ready to authenticate",
            ConnectionStatus::BackendUnavailable => "Internet OK - Auth server issues",
            ConnectionStatus::Offline => "No internet connection",
        }
    }
}

/// The backend is only probed once general internet reachability is confirmed.
pub async fn connection_status(net: &dyn Reachability) -> ConnectionStatus {
    if !net.has_internet().await {
        return ConnectionStatus::Offline;
    }
    if net.has_backend().await { ConnectionStatus::Ready } else { ConnectionStatus::BackendUnavailable }
}

pub struct HttpReachability {
    probes: Vec<String>,
    probe_http: reqwest::Client,
    backend: BackendClient,
    backend_http: reqwest::Client,
}

impl HttpReachability {
    pub fn new(cfg: &Config, backend: BackendClient) -> reqwest::Result<Self> {
        let probe_http = reqwest::Client::builder().timeout(cfg.probe_timeout).build()?;
        let backend_http = reqwest::Client::builder().timeout(cfg.request_timeout).build()?;
        Ok(Self { probes: cfg.probe_hosts.clone(), probe_http, backend, backend_http })
    }
}

#[async_trait]
impl Reachability for HttpReachability {
    async fn has_internet(&self) -> bool {
        for endpoint in self.probes.iter() {
            match self.probe_http.get(endpoint).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => return true,
                Ok(resp) => debug!(target: "net", "probe {} answered {}", endpoint, resp.status()),
                Err(e) => debug!(target: "net", "probe {} failed: {}", endpoint, e),
            }
        }
        false
    }

    async fn has_backend(&self) -> bool {
        let endpoint = self.backend.url(REST_ROOT_PATH);
        probe_backend(&self.backend_http, &endpoint, self.backend.headers(None)).await
    }
}

/// Resolve the endpoint's host, then issue an authenticated GET. Anything but 200 is `false`.
pub async fn probe_backend(http: &reqwest::Client, endpoint: &str, headers: HeaderMap) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else { return false; };
    let Some(host) = url.host_str() else { return false; };
    let port = url.port_or_known_default().unwrap_or(443);
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => {
            if addrs.next().is_none() { return false; }
        }
        Err(e) => {
            debug!(target: "net", "backend host {} did not resolve: {}", host, e);
            return false;
        }
    }
    match http.get(url).headers(headers).send().await {
        Ok(resp) => resp.status() == StatusCode::OK,
        Err(e) => {
            debug!(target: "net", "backend probe failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg_for(server: &MockServer, probes: Vec<String>) -> Config {
        let mut cfg = Config::new(server.uri(), "anon");
        cfg.probe_hosts = probes;
        cfg
    }

    fn reach(cfg: &Config) -> HttpReachability {
        HttpReachability::new(cfg, BackendClient::for_client(cfg).unwrap()).unwrap()
    }

    struct Fixed(bool, bool);

    #[async_trait]
    impl Reachability for Fixed {
        async fn has_internet(&self) -> bool { self.0 }
        async fn has_backend(&self) -> bool { self.1 }
    }

    #[tokio::test]
    async fn internet_succeeds_on_first_ok_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/down")).respond_with(ResponseTemplate::new(503)).mount(&server).await;
        Mock::given(method("GET")).and(path("/up")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        let cfg = cfg_for(&server, vec![
            "http://127.0.0.1:9/unreachable".into(),
            format!("{}/down", server.uri()),
            format!("{}/up", server.uri()),
        ]);
        assert!(reach(&cfg).has_internet().await);
    }

    #[tokio::test]
    async fn internet_false_when_every_probe_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        let cfg = cfg_for(&server, vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())]);
        assert!(!reach(&cfg).has_internet().await);
    }

    #[tokio::test]
    async fn backend_probe_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let cfg = cfg_for(&server, vec![]);
        assert!(reach(&cfg).has_backend().await);
    }

    #[tokio::test]
    async fn backend_non_200_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/rest/v1/")).respond_with(ResponseTemplate::new(401)).mount(&server).await;
        let cfg = cfg_for(&server, vec![]);
        assert!(!reach(&cfg).has_backend().await);
    }

    #[tokio::test]
    async fn unresolvable_backend_host_is_false() {
        let http = reqwest::Client::new();
        assert!(!probe_backend(&http, "https://backend.invalid/rest/v1/", HeaderMap::new()).await);
        assert!(!probe_backend(&http, "not a url", HeaderMap::new()).await);
    }

    #[tokio::test]
    async fn status_summary() {
        assert_eq!(connection_status(&Fixed(true, true)).await, ConnectionStatus::Ready);
        assert_eq!(connection_status(&Fixed(true, false)).await, ConnectionStatus::BackendUnavailable);
        assert_eq!(connection_status(&Fixed(false, true)).await, ConnectionStatus::Offline);
        assert_eq!(ConnectionStatus::Offline.message(), "No internet connection");
    }
}
