//! Runtime configuration for the sign-in shell and the certificate API.
//! Environment variables win; a JSON config file fills whatever is left unset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_PROBE_HOSTS: &[&str] = &[
    "https://www.google.com",
    "https://httpbin.org/get",
    "https://www.cloudflare.com",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration not found: {0} must be set via environment or config file")]
    Missing(&'static str),
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote identity / tabular / object service, without trailing slash.
    pub backend_url: String,
    /// Public key sent by the interactive client.
    pub backend_key: String,
    /// Key used by the API server for storage and database writes.
    pub service_key: String,
    pub bucket: String,
    pub certificates_table: String,
    pub users_table: String,
    pub session_file: PathBuf,
    pub session_key_file: PathBuf,
    pub journal_file: Option<PathBuf>,
    pub http_port: u16,
    pub probe_hosts: Vec<String>,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    /// Accept clear-text secrets in the user table (constant-time compared) until rows are migrated.
    pub allow_plaintext_secrets: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    backend_url: Option<String>,
    #[serde(default)]
    backend_key: Option<String>,
    #[serde(default)]
    service_key: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    users_table: Option<String>,
    #[serde(default)]
    certificates_table: Option<String>,
    #[serde(default)]
    session_file: Option<PathBuf>,
    #[serde(default)]
    http_port: Option<u16>,
    #[serde(default)]
    allow_plaintext_secrets: Option<bool>,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

impl Config {
    /// Build a config with defaults around an explicit backend.
    pub fn new(backend_url: impl Into<String>, backend_key: impl Into<String>) -> Self {
        let backend_url = backend_url.into().trim_end_matches('/').to_string();
        let backend_key = backend_key.into();
        Self {
            backend_url,
            service_key: backend_key.clone(),
            backend_key,
            bucket: "certificates".into(),
            certificates_table: "certificates".into(),
            users_table: "Users".into(),
            session_file: PathBuf::from(".session_data"),
            session_key_file: PathBuf::from(".session_key"),
            journal_file: Some(PathBuf::from("issuance_journal.jsonl")),
            http_port: 8000,
            probe_hosts: DEFAULT_PROBE_HOSTS.iter().map(|s| s.to_string()).collect(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            allow_plaintext_secrets: true,
        }
    }

    /// Load from `WIPECERT_*` environment variables, then `WIPECERT_CONFIG` (default `config.json`).
    pub fn load() -> Result<Self, ConfigError> {
        let mut url = env_nonempty("WIPECERT_BACKEND_URL");
        let mut key = env_nonempty("WIPECERT_BACKEND_KEY");
        let mut file = FileConfig::default();

        if url.is_none() || key.is_none() {
            let path = env_nonempty("WIPECERT_CONFIG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.json"));
            if path.exists() {
                debug!(target: "startup", "reading config file {}", path.display());
                file = read_file_config(&path)?;
                url = url.or(file.backend_url.take());
                key = key.or(file.backend_key.take());
            } else {
                warn!(target: "startup", "no config file at {} and backend not set in environment", path.display());
            }
        }

        let url = url.ok_or(ConfigError::Missing("WIPECERT_BACKEND_URL"))?;
        let key = key.ok_or(ConfigError::Missing("WIPECERT_BACKEND_KEY"))?;
        let mut cfg = Config::new(url, key);

        if let Some(k) = env_nonempty("WIPECERT_SERVICE_KEY").or(file.service_key) { cfg.service_key = k; }
        if let Some(b) = file.bucket { cfg.bucket = b; }
        if let Some(t) = file.users_table { cfg.users_table = t; }
        if let Some(t) = file.certificates_table { cfg.certificates_table = t; }
        if let Some(p) = env_nonempty("WIPECERT_SESSION_FILE").map(PathBuf::from).or(file.session_file) { cfg.session_file = p; }
        if let Some(p) = env_nonempty("WIPECERT_SESSION_KEY_FILE") { cfg.session_key_file = PathBuf::from(p); }
        if let Some(p) = env_nonempty("WIPECERT_JOURNAL_FILE") {
            cfg.journal_file = if p == "-" { None } else { Some(PathBuf::from(p)) };
        }
        if let Some(port) = env_nonempty("WIPECERT_HTTP_PORT").and_then(|p| p.parse::<u16>().ok()).or(file.http_port) {
            cfg.http_port = port;
        }
        if let Some(b) = env_nonempty("WIPECERT_ALLOW_PLAINTEXT_SECRETS").and_then(|v| parse_bool(&v)).or(file.allow_plaintext_secrets) {
            cfg.allow_plaintext_secrets = b;
        }
        Ok(cfg)
    }
}
