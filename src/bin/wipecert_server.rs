//!
//! wipecert API server binary
//! --------------------------
//! Starts the certificate HTTP API. Backend settings come from `WIPECERT_*` environment
//! variables or `config.json`; the port can be overridden on the command line.

use anyhow::{Context, Result};
use std::env;

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return args[i + 1].parse::<u16>().ok();
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("wipecert certificate API\n\nUSAGE:\n  wipecert_server [--http-port N]\n\nOPTIONS:\n  --http-port N   HTTP port (env: WIPECERT_HTTP_PORT, default 8000)\n\nENVIRONMENT:\n  WIPECERT_BACKEND_URL, WIPECERT_BACKEND_KEY, WIPECERT_SERVICE_KEY, WIPECERT_JOURNAL_FILE, WIPECERT_CONFIG\n");
        return Ok(());
    }

    let cfg = wipecert::config::Config::load().context("loading configuration")?;
    let http_port = parse_port_arg(&args, "--http-port").unwrap_or(cfg.http_port);
    tracing::info!(target: "startup", "backend={} bucket={} table={}", cfg.backend_url, cfg.bucket, cfg.certificates_table);
    wipecert::server::run_with_port(&cfg, http_port).await
}
