use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields describing one completed media sanitization. Column names match the certificate table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizationRecord {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub property_number: Option<String>,
    pub media_type: String,
    pub media_source: String,
    pub pre_sanitization_confidentiality: Option<String>,
    pub sanitization_method: String,
    pub sanitization_technique: String,
    pub tool_used: String,
    pub verification_method: String,
    pub post_sanitization_confidentiality: Option<String>,
    pub post_sanitization_destination: Option<String>,
}

impl SanitizationRecord {
    /// Names of required fields that are empty or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let required: [(&'static str, &str); 9] = [
            ("manufacturer", self.manufacturer.as_str()),
            ("model", self.model.as_str()),
            ("serial_number", self.serial_number.as_str()),
            ("media_type", self.media_type.as_str()),
            ("media_source", self.media_source.as_str()),
            ("sanitization_method", self.sanitization_method.as_str()),
            ("sanitization_technique", self.sanitization_technique.as_str()),
            ("tool_used", self.tool_used.as_str()),
            ("verification_method", self.verification_method.as_str()),
        ];
        required.iter().filter(|(_, v)| v.trim().is_empty()).map(|(name, _)| *name).collect()
    }

    /// Model name made safe for use inside an object filename.
    pub fn safe_model(&self) -> String { self.model.replace([' ', '/'], "_") }
}

/// One issued certificate, as stored in the certificate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: Uuid,
    #[serde(rename = "user_id")]
    pub identity_id: String,
    #[serde(rename = "user_email")]
    pub identity_email: String,
    #[serde(flatten)]
    pub sanitization: SanitizationRecord,
    #[serde(rename = "pdf_url")]
    pub document_url: String,
    pub created_at: DateTime<Utc>,
}

/// `cert_{identity}_{model}_{certificate}.pdf`
pub fn document_filename(identity_id: &str, record: &SanitizationRecord, certificate_id: Uuid) -> String {
    format!("cert_{}_{}_{}.pdf", identity_id, record.safe_model(), certificate_id)
}

#[cfg(test)]
pub(crate) fn sample_record() -> SanitizationRecord {
    SanitizationRecord {
        manufacturer: "Seagate".into(),
        model: "Barracuda 7200/12".into(),
        serial_number: "Z1D4K2".into(),
        property_number: None,
        media_type: "magnetic".into(),
        media_source: "computer".into(),
        pre_sanitization_confidentiality: Some("confidential".into()),
        sanitization_method: "purge".into(),
        sanitization_technique: "overwrite".into(),
        tool_used: "wipecert 0.3".into(),
        verification_method: "full read-back".into(),
        post_sanitization_confidentiality: None,
        post_sanitization_destination: Some("reuse".into()),
    }
}
