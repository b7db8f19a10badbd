//!
//! wipecert HTTP API
//! -----------------
//! Axum routes exposing certificate issuance and queries. Stateless: every request carries a
//! bearer token that is verified afresh through the identity service; nothing is cached
//! between requests.
//!
//! Routes:
//! - `POST /generate-certificate` issue one certificate for the caller.
//! - `GET /my-certificates` page through the caller's certificates.
//! - `GET /certificates-by-device/{model}` the caller's certificates for one device model.
//! - `GET /user-info` who the token belongs to.
//! - `GET /health`, `GET /` liveness and version.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::backend::BackendClient;
use crate::certificate::{CertificateIssuer, SanitizationRecord};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{IdentityClient, TokenVerifier};

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    issuer: Arc<CertificateIssuer>,
}

pub fn router(issuer: Arc<CertificateIssuer>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/generate-certificate", post(generate_certificate))
        .route("/my-certificates", get(my_certificates))
        .route("/certificates-by-device/{model}", get(certificates_by_device))
        .route("/user-info", get(user_info))
        .layer(CorsLayer::permissive())
        .with_state(AppState { issuer })
}

pub async fn run_with_port(cfg: &Config, http_port: u16) -> anyhow::Result<()> {
    let backend = BackendClient::for_service(cfg).context("building backend client")?;
    let verifier: Arc<dyn TokenVerifier> = Arc::new(IdentityClient::new(backend, cfg));
    let issuer = CertificateIssuer::from_config(cfg, verifier).context("building certificate issuer")?;
    if let Some(journal) = issuer.journal() {
        match journal.unreconciled() {
            Ok(open) if !open.is_empty() => {
                tracing::warn!(target: "startup", "{} issuance(s) in {} uploaded without a certificate row", open.len(), journal.path().display());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(target: "startup", "could not read journal {}: {}", journal.path().display(), e),
        }
        if let Err(e) = journal.compact() {
            tracing::warn!(target: "startup", "could not compact journal {}: {}", journal.path().display(), e);
        }
    }
    let app = router(Arc::new(issuer));

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!(target: "startup", "Starting certificate API on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    run_with_port(cfg, cfg.http_port).await
}

fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::auth("missing_token", "Missing or invalid authorization header"))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 { 10 }

async fn root() -> Json<Value> {
    Json(json!({"message": "Authenticated Media Sanitization Certificate Generator API", "version": API_VERSION}))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "timestamp": Utc::now().to_rfc3339()}))
}

async fn generate_certificate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SanitizationRecord>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    let Json(record) = body.map_err(|e| AppError::user("invalid_record".to_string(), e.body_text()))?;
    let missing = record.missing_fields();
    if !missing.is_empty() {
        return Err(AppError::user("invalid_record".to_string(), format!("missing required field(s): {}", missing.join(", "))));
    }
    let cert = state.issuer.issue(token, &record).await?;
    Ok(Json(json!({
        "certificate_id": cert.certificate_id,
        "pdf_url": cert.document_url,
        "created_at": cert.created_at.to_rfc3339(),
        "user_id": cert.identity_id,
        "device_model": cert.sanitization.model,
        "message": "Certificate generated and stored successfully",
    })))
}

async fn my_certificates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Value>> {
    let identity = state.issuer.authorize(bearer_token(&headers)?).await?;
    let rows = state.issuer.list_by_identity(&identity.id, params.limit, params.offset).await?;
    Ok(Json(json!({"user_id": identity.id, "count": rows.len(), "certificates": rows})))
}

async fn certificates_by_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> AppResult<Json<Value>> {
    let identity = state.issuer.authorize(bearer_token(&headers)?).await?;
    let rows = state.issuer.list_by_model(&identity.id, &model).await?;
    let manufacturer = rows
        .first()
        .and_then(|r| r.get("manufacturer"))
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown")
        .to_string();
    Ok(Json(json!({
        "device_model": model,
        "manufacturer": manufacturer,
        "total_certificates": rows.len(),
        "certificates": rows,
    })))
}

async fn user_info(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let identity = state.issuer.authorize(bearer_token(&headers)?).await?;
    Ok(Json(json!({"user_id": identity.id, "email": identity.email, "authenticated": true})))
}
