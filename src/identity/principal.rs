use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const TABLE_AUTH_PREFIX: &str = "table_auth_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    RemoteAuth,
    TableLookup,
}

impl Display for VerificationMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::RemoteAuth => write!(f, "remote_auth"),
            VerificationMethod::TableLookup => write!(f, "table_lookup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub verification_method: VerificationMethod,
    pub created_at: DateTime<Utc>,
}

/// Opaque bearer string, classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessToken {
    Bearer(String),
    TableAuth { identity_id: String },
}

impl AccessToken {
    pub fn table_auth(identity_id: impl Into<String>) -> Self {
        AccessToken::TableAuth { identity_id: identity_id.into() }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(TABLE_AUTH_PREFIX) {
            Some(id) => AccessToken::TableAuth { identity_id: id.to_string() },
            None => AccessToken::Bearer(raw.to_string()),
        }
    }

    /// Which verification capability can vouch for this token.
    pub fn method(&self) -> VerificationMethod {
        match self {
            AccessToken::Bearer(_) => VerificationMethod::RemoteAuth,
            AccessToken::TableAuth { .. } => VerificationMethod::TableLookup,
        }
    }
}

impl Display for AccessToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessToken::Bearer(t) => write!(f, "{}", t),
            AccessToken::TableAuth { identity_id } => write!(f, "{}{}", TABLE_AUTH_PREFIX, identity_id),
        }
    }
}

/// Email + secret held only for the duration of one sign-in attempt.
#[derive(Clone)]
pub struct Credential {
    pub email: String,
    pub secret: String,
}

impl Credential {
    pub fn new(email: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { email: email.into().trim().to_string(), secret: secret.into() }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("email", &self.email).field("secret", &"<redacted>").finish()
    }
}

/// Result of a successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignIn {
    pub identity: Identity,
    pub access_token: AccessToken,
    pub method: VerificationMethod,
}

/// Render a JSON id (string or number) as a string.
pub fn json_id(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse remote timestamps, with or without an offset.
pub fn parse_timestamp(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn access_token_shape_round_trip() {
        let t = AccessToken::table_auth("42");
        assert_eq!(t.to_string(), "table_auth_42");
        assert_eq!(AccessToken::parse("table_auth_42"), t);
        assert_eq!(t.method(), VerificationMethod::TableLookup);

        let b = AccessToken::parse("eyJhbGciOi.x.y");
        assert_eq!(b.method(), VerificationMethod::RemoteAuth);
        assert_eq!(b.to_string(), "eyJhbGciOi.x.y");
    }

    #[test]
    fn credential_trims_email_and_hides_secret() {
        let c = Credential::new("  a@b.com ", "hunter2");
        assert_eq!(c.email, "a@b.com");
        let dbg = format!("{:?}", c);
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn json_ids_and_timestamps() {
        assert_eq!(json_id(&json!(7)), Some("7".to_string()));
        assert_eq!(json_id(&json!("u-1")), Some("u-1".to_string()));
        assert_eq!(json_id(&json!(null)), None);

        assert!(parse_timestamp(&json!("2024-05-01T10:00:00+00:00")).is_some());
        assert!(parse_timestamp(&json!("2024-05-01T10:00:00.123456")).is_some());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn verification_method_serializes_snake_case() {
        assert_eq!(serde_json::to_value(VerificationMethod::TableLookup).unwrap(), json!("table_lookup"));
    }
}
