//! Sanitization certificates: the record model, PDF rendering and the issuance pipeline.

mod model;
mod render;
mod journal;
mod issuer;

pub use model::{document_filename, Certificate, SanitizationRecord};
pub use render::{render, render_at, RenderError, ORGANIZATION};
pub use journal::{Intent, IntentJournal, IntentStage};
pub use issuer::{
    CertificateIssuer, CertificateRepository, CertificateTable, DocumentStore, IssuanceError, UNKNOWN_EMAIL,
};

#[cfg(test)]
pub(crate) use issuer::fakes;
#[cfg(test)]
pub(crate) use model::sample_record;
