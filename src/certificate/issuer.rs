//! Issuance pipeline: authorize, render + upload, record.
//!
//! The remote store and database share no transaction. A failed upload stops before any row
//! is written; a failed insert leaves the uploaded document in place and says so in the error.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::journal::{Intent, IntentJournal, IntentStage};
use super::model::{document_filename, Certificate, SanitizationRecord};
use super::render::{render, RenderError};
use crate::backend::{eq_filter, error_detail, BackendClient};
use crate::config::Config;
use crate::identity::{Identity, TokenVerifier};

pub const UNKNOWN_EMAIL: &str = "unknown@example.com";

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("Invalid authentication token")]
    Unauthorized,
    #[error("invalid sanitization record: {0}")]
    InvalidRecord(String),
    #[error("Failed to upload PDF: {0}")]
    StorageFailure(String),
    #[error("Failed to store certificate {certificate_id} in database; document remains at {document_url}: {detail}")]
    RecordFailure { certificate_id: Uuid, document_url: String, detail: String },
    #[error("{0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Failed to render certificate: {0}")]
    RenderFailure(String),
}

impl From<RenderError> for IssuanceError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::MissingField(_) => IssuanceError::InvalidRecord(e.to_string()),
            RenderError::Encode(_) => IssuanceError::RenderFailure(e.to_string()),
        }
    }
}

/// Object storage for rendered documents. Returns the public URL on success.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upload(&self, bucket: &str, filename: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Certificate table access. Filters are exact-match column/value pairs.
#[async_trait]
pub trait CertificateRepository: Send + Sync {
    async fn insert(&self, certificate: &Certificate) -> Result<()>;
    async fn select(&self, filters: &[(&str, &str)], limit: Option<u32>, offset: Option<u32>) -> Result<Vec<Value>>;
}

#[async_trait]
impl DocumentStore for BackendClient {
    async fn upload(&self, bucket: &str, filename: &str, bytes: Vec<u8>) -> Result<String> {
        let resp = self.post_bytes(&BackendClient::object_path(bucket, filename), "application/pdf", bytes).await?;
        if !resp.status().is_success() {
            bail!(error_detail(resp).await);
        }
        Ok(self.public_object_url(bucket, filename))
    }
}

/// The certificate table on the remote tabular endpoint.
#[derive(Clone)]
pub struct CertificateTable {
    backend: BackendClient,
    table: String,
}

impl CertificateTable {
    pub fn new(backend: BackendClient, table: impl Into<String>) -> Self { Self { backend, table: table.into() } }
}

#[async_trait]
impl CertificateRepository for CertificateTable {
    async fn insert(&self, certificate: &Certificate) -> Result<()> {
        let resp = self.backend.post_json(&BackendClient::table_path(&self.table), &[], certificate).await?;
        if !resp.status().is_success() {
            bail!(error_detail(resp).await);
        }
        Ok(())
    }

    async fn select(&self, filters: &[(&str, &str)], limit: Option<u32>, offset: Option<u32>) -> Result<Vec<Value>> {
        let mut query: Vec<(String, String)> = filters.iter().map(|(c, v)| eq_filter(c, v)).collect();
        if let Some(limit) = limit.filter(|l| *l > 0) {
            query.push(("limit".into(), limit.to_string()));
        }
        if let Some(offset) = offset.filter(|o| *o > 0) {
            query.push(("offset".into(), offset.to_string()));
        }
        let resp = self.backend.get(&BackendClient::table_path(&self.table), &query, None).await?;
        if !resp.status().is_success() {
            bail!(error_detail(resp).await);
        }
        Ok(resp.json::<Vec<Value>>().await?)
    }
}

pub struct CertificateIssuer {
    verifier: Arc<dyn TokenVerifier>,
    documents: Arc<dyn DocumentStore>,
    records: Arc<dyn CertificateRepository>,
    journal: Option<Arc<IntentJournal>>,
    bucket: String,
}

impl CertificateIssuer {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        documents: Arc<dyn DocumentStore>,
        records: Arc<dyn CertificateRepository>,
        bucket: impl Into<String>,
    ) -> Self {
        Self { verifier, documents, records, journal: None, bucket: bucket.into() }
    }

    pub fn with_journal(mut self, journal: Arc<IntentJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Remote store, table and journal as configured, writing with the service key.
    pub fn from_config(cfg: &Config, verifier: Arc<dyn TokenVerifier>) -> reqwest::Result<Self> {
        let backend = BackendClient::for_service(cfg)?;
        let table = CertificateTable::new(backend.clone(), cfg.certificates_table.clone());
        let issuer = Self::new(verifier, Arc::new(backend), Arc::new(table), cfg.bucket.clone());
        Ok(match &cfg.journal_file {
            Some(path) => issuer.with_journal(Arc::new(IntentJournal::new(path.clone()))),
            None => issuer,
        })
    }

    pub fn journal(&self) -> Option<&IntentJournal> { self.journal.as_deref() }

    /// Journal writes are synchronous file I/O; keep them off the async workers.
    async fn note(&self, intent: Intent) {
        let Some(journal) = self.journal.clone() else { return };
        if let Err(e) = tokio::task::spawn_blocking(move || journal.note(intent)).await {
            warn!(target: "issuer", "journal task failed: {}", e);
        }
    }

    /// Resolve the caller's identity; every request verifies afresh.
    pub async fn authorize(&self, token: &str) -> Result<Identity, IssuanceError> {
        self.verifier.verify_token(token).await.ok_or(IssuanceError::Unauthorized)
    }

    pub async fn issue(&self, token: &str, record: &SanitizationRecord) -> Result<Certificate, IssuanceError> {
        let identity = self.authorize(token).await?;
        let email = if identity.email.is_empty() { UNKNOWN_EMAIL } else { identity.email.as_str() };
        info!(target: "issuer", "issuing certificate for {} ({})", email, record.model);

        let certificate_id = Uuid::new_v4();
        let pdf = render(record, certificate_id, email)?;
        let filename = document_filename(&identity.id, record, certificate_id);
        debug!(target: "issuer", "rendered {} ({} bytes)", filename, pdf.len());

        self.note(Intent::new(certificate_id, IntentStage::UploadPending, &identity.id, &filename)).await;
        let document_url = match self.documents.upload(&self.bucket, &filename, pdf).await {
            Ok(url) => url,
            Err(e) => {
                error!(target: "issuer", "upload of {} failed: {}", filename, e);
                self.note(Intent::new(certificate_id, IntentStage::Failed, &identity.id, &filename).with_detail(e.to_string())).await;
                return Err(IssuanceError::StorageFailure(e.to_string()));
            }
        };
        self.note(Intent::new(certificate_id, IntentStage::Uploaded, &identity.id, &filename).with_url(&document_url)).await;

        let certificate = Certificate {
            certificate_id,
            identity_id: identity.id.clone(),
            identity_email: email.to_string(),
            sanitization: record.clone(),
            document_url: document_url.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.records.insert(&certificate).await {
            error!(target: "issuer", "certificate {} uploaded to {} but not recorded: {}", certificate_id, document_url, e);
            self.note(
                Intent::new(certificate_id, IntentStage::Failed, &identity.id, &filename)
                    .with_url(&document_url)
                    .with_detail(e.to_string()),
            )
            .await;
            return Err(IssuanceError::RecordFailure { certificate_id, document_url, detail: e.to_string() });
        }
        self.note(Intent::new(certificate_id, IntentStage::Recorded, &identity.id, &filename).with_url(&document_url)).await;
        info!(target: "issuer", "certificate {} recorded", certificate_id);
        Ok(certificate)
    }

    /// Certificates issued by one identity; may be empty.
    pub async fn list_by_identity(&self, identity_id: &str, limit: u32, offset: u32) -> Result<Vec<Value>, IssuanceError> {
        self.records
            .select(&[("user_id", identity_id)], Some(limit), Some(offset))
            .await
            .map_err(|e| IssuanceError::Database(e.to_string()))
    }

    /// Certificates for one device model; `NotFound` when there are none.
    pub async fn list_by_model(&self, identity_id: &str, model: &str) -> Result<Vec<Value>, IssuanceError> {
        let rows = self
            .records
            .select(&[("user_id", identity_id), ("model", model)], None, None)
            .await
            .map_err(|e| IssuanceError::Database(e.to_string()))?;
        if rows.is_empty() {
            return Err(IssuanceError::NotFound(format!("No certificates found for device model: {}", model)));
        }
        Ok(rows)
    }
}
